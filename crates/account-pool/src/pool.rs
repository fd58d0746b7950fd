//! Pool state machine and least-recently-used account selection
//!
//! The pool owns every account transition. `acquire` holds a process-local
//! mutex across select-then-mark so two tasks in this process cannot claim the
//! same account; the repository's conditional `mark_account_in_use` covers
//! other processes sharing the store. The lock is never held while work runs.
//!
//! Cooldown and quarantine are deadlines, not states: an account whose deadline
//! has passed is simply selectable again on the next scan.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, SystemClock};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountStatus, ReleaseOutcome};
use crate::error::{Error, Result};
use crate::repository::{AccountRelease, PoolStats, ResourceRepository};

/// Longest single sleep inside `wait_for_available_account`, so cancellation
/// and out-of-band releases are noticed promptly.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Pool timing and failure policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Rest period after a normal visit.
    pub cooldown: Duration,
    /// Rest period after `max_failures` consecutive transient failures.
    /// Banned accounts rest twice this long.
    pub quarantine: Duration,
    pub max_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(600),
            quarantine: Duration::from_secs(3600),
            max_failures: 3,
        }
    }
}

/// Per-account entry in the pool status. Never carries credentials.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<u64>,
    pub consecutive_failures: u32,
    pub total_uses: u64,
}

/// Observability snapshot returned by `get_pool_status()`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// "healthy" when every active account is usable, "degraded" when some are,
    /// "unhealthy" when none are.
    pub status: &'static str,
    #[serde(flatten)]
    pub counts: PoolStats,
    /// Seconds until the next blocked account frees up; 0 when one is usable now.
    pub wait_time_secs: Option<u64>,
    pub cooldown_secs: u64,
    pub quarantine_secs: u64,
    pub max_failures: u32,
    pub accounts: Vec<AccountSummary>,
}

/// Account pool over a resource repository.
pub struct AccountPool {
    repository: Arc<dyn ResourceRepository>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    select_lock: Mutex<()>,
}

impl AccountPool {
    pub fn new(repository: Arc<dyn ResourceRepository>, config: PoolConfig) -> Self {
        Self::with_clock(repository, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn ResourceRepository>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            cooldown_secs = config.cooldown.as_secs(),
            quarantine_secs = config.quarantine.as_secs(),
            max_failures = config.max_failures,
            "account pool initialized"
        );
        Self {
            repository,
            config,
            clock,
            select_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Claim the least-recently-used selectable account.
    ///
    /// Walks candidates oldest-first; a candidate claimed by another process
    /// between listing and marking is skipped. Returns `None` when nothing
    /// qualifies.
    pub async fn acquire(&self) -> Result<Option<Account>> {
        let _guard = self.select_lock.lock().await;
        let now = self.clock.now_millis();

        for candidate in self.repository.get_available_accounts(now).await? {
            if !self.repository.mark_account_in_use(&candidate.id, now).await? {
                debug!(account_id = candidate.id, "account claimed elsewhere, trying next");
                continue;
            }
            let account = self
                .repository
                .get_account_by_id(&candidate.id)
                .await?
                .ok_or_else(|| Error::NotFound(candidate.id.clone()))?;
            info!(
                account_id = account.id,
                total_uses = account.total_uses,
                "account acquired"
            );
            return Ok(Some(account));
        }

        debug!("no account available");
        Ok(None)
    }

    /// Return an account with the outcome of its visit.
    ///
    /// - Success / NoCapacity: failures reset, cooldown starts
    /// - TransientFailure: failures +1; quarantine when `max_failures` is
    ///   reached, otherwise immediately available again
    /// - Banned: quarantine for twice the quarantine period, regardless of count
    ///
    /// Returns `false` if the repository did not consider the account in use.
    pub async fn release(
        &self,
        account_id: &str,
        outcome: ReleaseOutcome,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let account = self
            .repository
            .get_account_by_id(account_id)
            .await?
            .ok_or_else(|| Error::NotFound(account_id.to_string()))?;
        let now = self.clock.now_millis();

        let release = match outcome {
            ReleaseOutcome::Success | ReleaseOutcome::NoCapacity => {
                let until = now + millis(self.config.cooldown);
                debug!(
                    account_id,
                    %outcome,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "account entering cooldown"
                );
                AccountRelease {
                    outcome,
                    consecutive_failures: 0,
                    cooldown_until: Some(until),
                    quarantine_until: None,
                    error_message: error_message.map(str::to_owned),
                }
            }
            ReleaseOutcome::TransientFailure => {
                let failures = account.consecutive_failures.saturating_add(1);
                let quarantine_until = if failures >= self.config.max_failures {
                    warn!(
                        account_id,
                        consecutive_failures = failures,
                        quarantine_secs = self.config.quarantine.as_secs(),
                        error = error_message.unwrap_or(""),
                        "failure threshold reached, account quarantined"
                    );
                    Some(now + millis(self.config.quarantine))
                } else {
                    debug!(
                        account_id,
                        consecutive_failures = failures,
                        error = error_message.unwrap_or(""),
                        "transient failure, account stays in rotation"
                    );
                    None
                };
                AccountRelease {
                    outcome,
                    consecutive_failures: failures,
                    cooldown_until: None,
                    quarantine_until,
                    error_message: error_message.map(str::to_owned),
                }
            }
            ReleaseOutcome::Banned => {
                let extended = self.config.quarantine * 2;
                warn!(
                    account_id,
                    quarantine_secs = extended.as_secs(),
                    error = error_message.unwrap_or(""),
                    "terminal failure, account quarantined (extended)"
                );
                AccountRelease {
                    outcome,
                    consecutive_failures: account.consecutive_failures.saturating_add(1),
                    cooldown_until: None,
                    quarantine_until: Some(now + millis(extended)),
                    error_message: error_message.map(str::to_owned),
                }
            }
        };

        let released = self.repository.release_account(account_id, release).await?;
        if released {
            metrics::counter!("pool_account_releases_total", "outcome" => outcome.label())
                .increment(1);
        } else {
            warn!(account_id, %outcome, "release had no effect (account not in use)");
        }
        Ok(released)
    }

    /// Time until some account becomes selectable.
    ///
    /// `Some(ZERO)` when one is selectable now; `None` when nothing blocked has
    /// a future deadline (every account in use or inactive).
    pub async fn get_wait_time(&self) -> Result<Option<Duration>> {
        let now = self.clock.now_millis();
        if !self.repository.get_available_accounts(now).await?.is_empty() {
            return Ok(Some(Duration::ZERO));
        }
        Ok(self
            .repository
            .get_next_available_cooldown_time(now)
            .await?
            .map(|t| Duration::from_millis(t.saturating_sub(now))))
    }

    /// Number of accounts selectable right now.
    pub async fn usable_count(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        Ok(self.repository.get_pool_stats(now).await?.available)
    }

    /// Sleep until an account qualifies, `timeout` elapses, or `shutdown` fires.
    ///
    /// Each sleep is capped at 60 seconds before re-checking. Returns `true`
    /// only when an account is selectable.
    pub async fn wait_for_available_account(
        &self,
        timeout: Option<Duration>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if shutdown.is_cancelled() {
                return Ok(false);
            }
            let wait = match self.get_wait_time().await? {
                Some(wait) if wait.is_zero() => return Ok(true),
                Some(wait) => wait.min(MAX_POLL_INTERVAL),
                None => MAX_POLL_INTERVAL,
            };

            let sleep_for = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        debug!("timed out waiting for an available account");
                        return Ok(false);
                    }
                    wait.min(remaining)
                }
                None => wait,
            };

            debug!(sleep_secs = sleep_for.as_secs(), "waiting for an available account");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested while waiting for an account");
                    return Ok(false);
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Pool summary for operators.
    pub async fn get_pool_status(&self) -> Result<PoolStatus> {
        let now = self.clock.now_millis();
        let accounts = self.repository.list_accounts().await?;

        let mut counts = PoolStats::default();
        let mut summaries = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let status = account.status(now);
            counts.count(status);
            let remaining_secs = match status {
                AccountStatus::Cooldown { until } | AccountStatus::Quarantined { until } => {
                    Some(until.saturating_sub(now).div_ceil(1000))
                }
                _ => None,
            };
            summaries.push(AccountSummary {
                id: account.id.clone(),
                status: status.label(),
                remaining_secs,
                consecutive_failures: account.consecutive_failures,
                total_uses: account.total_uses,
            });
        }

        let active = counts.total - counts.inactive;
        let status = if counts.available > 0 && counts.available == active {
            "healthy"
        } else if counts.available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let wait_time_secs = self
            .get_wait_time()
            .await?
            .map(|w| w.as_millis().div_ceil(1000) as u64);

        Ok(PoolStatus {
            status,
            counts,
            wait_time_secs,
            cooldown_secs: self.config.cooldown.as_secs(),
            quarantine_secs: self.config.quarantine.as_secs(),
            max_failures: self.config.max_failures,
            accounts: summaries,
        })
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
