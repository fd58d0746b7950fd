//! Resource repository: storage seam behind the account pool
//!
//! The pool decides every transition; the repository only stores accounts and
//! offers one atomic conditional update (`mark_account_in_use`) so that several
//! processes sharing a store can never both claim the same account.
//! `MemoryRepository` is the single-process implementation: a map behind a std
//! `Mutex`, where the conditional update is one critical section.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info};

use crate::account::{Account, AccountSeed, AccountStatus, ReleaseOutcome};
use crate::error::{Error, Result};

/// Field updates applied when an account comes back from use.
#[derive(Debug, Clone)]
pub struct AccountRelease {
    pub outcome: ReleaseOutcome,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<u64>,
    pub quarantine_until: Option<u64>,
    pub error_message: Option<String>,
}

/// Account counts by derived status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub cooldown: usize,
    pub quarantined: usize,
    pub inactive: usize,
}

impl PoolStats {
    pub fn count(&mut self, status: AccountStatus) {
        self.total += 1;
        match status {
            AccountStatus::Available => self.available += 1,
            AccountStatus::InUse => self.in_use += 1,
            AccountStatus::Cooldown { .. } => self.cooldown += 1,
            AccountStatus::Quarantined { .. } => self.quarantined += 1,
            AccountStatus::Inactive => self.inactive += 1,
        }
    }
}

/// Storage operations the pool needs.
///
/// Timestamps are unix milliseconds supplied by the caller so every
/// implementation agrees with the pool's clock.
pub trait ResourceRepository: Send + Sync {
    /// Selectable accounts ordered least-recently-used first (never-used first).
    fn get_available_accounts(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>>;

    /// Atomically claim the account if it is still selectable at `now`.
    ///
    /// Sets `in_use`, `last_used_at = now` and bumps `total_uses`. Returns
    /// `false` when someone else got there first.
    fn mark_account_in_use<'a>(
        &'a self,
        id: &'a str,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Clear `in_use` and store the release fields. Returns `false` if the
    /// account is unknown or was not in use.
    fn release_account<'a>(
        &'a self,
        id: &'a str,
        release: AccountRelease,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    fn get_account_by_id<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Account>>> + Send + 'a>>;

    /// Earliest future moment at which a currently blocked (cooldown or
    /// quarantine) active account becomes selectable.
    fn get_next_available_cooldown_time(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + '_>>;

    fn get_pool_stats(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PoolStats>> + Send + '_>>;

    /// Every account, in id order.
    fn list_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>>;
}

/// Single-process repository.
pub struct MemoryRepository {
    accounts: Mutex<HashMap<String, Account>>,
}

impl MemoryRepository {
    pub fn new(accounts: Vec<Account>) -> Self {
        let accounts: HashMap<String, Account> =
            accounts.into_iter().map(|a| (a.id.clone(), a)).collect();
        info!(accounts = accounts.len(), "account repository initialized");
        Self {
            accounts: Mutex::new(accounts),
        }
    }

    /// Seed from a JSON array of `{id, credential_ref, is_active?}`.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Seed(format!("reading {}: {e}", path.display())))?;
        let seeds: Vec<AccountSeed> = serde_json::from_str(&contents)
            .map_err(|e| Error::Seed(format!("parsing {}: {e}", path.display())))?;
        info!(path = %path.display(), accounts = seeds.len(), "loaded accounts file");
        Ok(Self::new(seeds.into_iter().map(Account::from).collect()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available_now(&self, now: u64) -> Vec<Account> {
        let accounts = self.lock();
        let mut available: Vec<Account> = accounts
            .values()
            .filter(|a| a.is_selectable(now))
            .cloned()
            .collect();
        // Option orders None first, so never-used accounts lead
        available.sort_by(|a, b| {
            a.last_used_at
                .cmp(&b.last_used_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        available
    }

    fn mark_in_use_now(&self, id: &str, now: u64) -> bool {
        let mut accounts = self.lock();
        match accounts.get_mut(id) {
            Some(account) if account.is_selectable(now) => {
                account.in_use = true;
                account.last_used_at = Some(now);
                account.total_uses += 1;
                true
            }
            _ => false,
        }
    }

    fn release_now(&self, id: &str, release: AccountRelease) -> bool {
        let mut accounts = self.lock();
        let Some(account) = accounts.get_mut(id) else {
            return false;
        };
        if !account.in_use {
            debug!(account_id = id, "release for account that is not in use, ignoring");
            return false;
        }
        account.in_use = false;
        account.consecutive_failures = release.consecutive_failures;
        account.cooldown_until = release.cooldown_until;
        account.quarantine_until = release.quarantine_until;
        debug!(
            account_id = id,
            outcome = %release.outcome,
            error = ?release.error_message,
            "account released"
        );
        true
    }
}

impl ResourceRepository for MemoryRepository {
    fn get_available_accounts(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>> {
        Box::pin(async move { Ok(self.available_now(now)) })
    }

    fn mark_account_in_use<'a>(
        &'a self,
        id: &'a str,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(self.mark_in_use_now(id, now)) })
    }

    fn release_account<'a>(
        &'a self,
        id: &'a str,
        release: AccountRelease,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(self.release_now(id, release)) })
    }

    fn get_account_by_id<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Account>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.lock().get(id).cloned()) })
    }

    fn get_next_available_cooldown_time(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<u64>>> + Send + '_>> {
        Box::pin(async move {
            let accounts = self.lock();
            Ok(accounts
                .values()
                .filter(|a| a.is_active && !a.in_use)
                .filter_map(|a| a.blocked_until(now))
                .min())
        })
    }

    fn get_pool_stats(
        &self,
        now: u64,
    ) -> Pin<Box<dyn Future<Output = Result<PoolStats>> + Send + '_>> {
        Box::pin(async move {
            let accounts = self.lock();
            let mut stats = PoolStats::default();
            for account in accounts.values() {
                stats.count(account.status(now));
            }
            Ok(stats)
        })
    }

    fn list_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>> {
        Box::pin(async move {
            let mut accounts: Vec<Account> = self.lock().values().cloned().collect();
            accounts.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(accounts)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn used_at(id: &str, at: Option<u64>) -> Account {
        let mut account = Account::new(id, format!("ref-{id}"));
        account.last_used_at = at;
        account
    }

    #[tokio::test]
    async fn available_accounts_are_lru_ordered_nulls_first() {
        let repo = MemoryRepository::new(vec![
            used_at("c", Some(NOW - 10)),
            used_at("a", Some(NOW - 30)),
            used_at("never", None),
            used_at("b", Some(NOW - 20)),
        ]);
        let ids: Vec<String> = repo
            .get_available_accounts(NOW)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["never", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn mark_in_use_is_conditional() {
        let repo = MemoryRepository::new(vec![used_at("a", None)]);
        assert!(repo.mark_account_in_use("a", NOW).await.unwrap());
        assert!(!repo.mark_account_in_use("a", NOW).await.unwrap());
        assert!(!repo.mark_account_in_use("missing", NOW).await.unwrap());

        let account = repo.get_account_by_id("a").await.unwrap().unwrap();
        assert!(account.in_use);
        assert_eq!(account.last_used_at, Some(NOW));
        assert_eq!(account.total_uses, 1);
    }

    #[tokio::test]
    async fn release_requires_in_use() {
        let repo = MemoryRepository::new(vec![used_at("a", None)]);
        let release = AccountRelease {
            outcome: ReleaseOutcome::Success,
            consecutive_failures: 0,
            cooldown_until: Some(NOW + 1000),
            quarantine_until: None,
            error_message: None,
        };
        assert!(!repo.release_account("a", release.clone()).await.unwrap());
        repo.mark_account_in_use("a", NOW).await.unwrap();
        assert!(repo.release_account("a", release.clone()).await.unwrap());
        assert!(!repo.release_account("a", release).await.unwrap());
    }

    #[tokio::test]
    async fn next_cooldown_time_ignores_in_use_and_inactive() {
        let mut cooling = used_at("cooling", Some(NOW - 5));
        cooling.cooldown_until = Some(NOW + 500);
        let mut quarantined = used_at("quarantined", Some(NOW - 5));
        quarantined.quarantine_until = Some(NOW + 100);
        quarantined.is_active = false;
        let mut busy = used_at("busy", Some(NOW));
        busy.in_use = true;
        busy.cooldown_until = Some(NOW + 50);

        let repo = MemoryRepository::new(vec![cooling, quarantined, busy]);
        assert_eq!(
            repo.get_next_available_cooldown_time(NOW).await.unwrap(),
            Some(NOW + 500)
        );
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let mut cooling = used_at("cooling", Some(NOW - 5));
        cooling.cooldown_until = Some(NOW + 500);
        let mut inactive = used_at("inactive", None);
        inactive.is_active = false;
        let repo = MemoryRepository::new(vec![used_at("free", None), cooling, inactive]);
        repo.mark_account_in_use("free", NOW).await.unwrap();

        let stats = repo.get_pool_stats(NOW).await.unwrap();
        assert_eq!(
            stats,
            PoolStats {
                total: 3,
                available: 0,
                in_use: 1,
                cooldown: 1,
                quarantined: 0,
                inactive: 1,
            }
        );
    }

    #[tokio::test]
    async fn load_reads_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(
            &path,
            concat!(
                r#"[{"id":"a1","credential_ref":"vault://a1"},"#,
                r#"{"id":"a2","credential_ref":"vault://a2","is_active":false}]"#,
            ),
        )
        .unwrap();

        let repo = MemoryRepository::load(&path).await.unwrap();
        let accounts = repo.list_accounts().await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(accounts[0].is_active);
        assert!(!accounts[1].is_active);
    }

    #[tokio::test]
    async fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = MemoryRepository::load(&path).await.err().unwrap();
        assert!(matches!(err, Error::Seed(_)));
    }
}
