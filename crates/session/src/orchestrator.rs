//! One session: every mission group processed with bounded concurrency
//!
//! Per mission the sequence is fixed:
//! semaphore permit -> acquire account -> create worker -> start + process
//! -> close worker -> log usage -> release account -> drop permit.
//!
//! The worker is always closed and the account always released once acquired,
//! whatever the processor did (error, panic). Teardown happens before release
//! so the next holder of the account never overlaps a live worker.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use account_pool::{Account, AccountPool};
use common::{Clock, SystemClock};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::summary::{MissionResult, MissionStatus, SessionSummary};
use crate::{
    MissionContext, TaskOutcome, TaskProcessor, UsageRecord, WorkItem, WorkRepository,
    WorkerFactory,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on missions in flight at once. Must be > 0.
    pub max_concurrent_missions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_missions: 3,
        }
    }
}

/// Shared handles every mission task needs; cloned into each spawned task.
#[derive(Clone)]
struct MissionDeps {
    pool: Arc<AccountPool>,
    work: Arc<dyn WorkRepository>,
    workers: Arc<dyn WorkerFactory>,
    processor: Arc<dyn TaskProcessor>,
    clock: Arc<dyn Clock>,
}

pub struct SessionOrchestrator {
    deps: MissionDeps,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    session_counter: AtomicU64,
}

impl SessionOrchestrator {
    pub fn new(
        pool: Arc<AccountPool>,
        work: Arc<dyn WorkRepository>,
        workers: Arc<dyn WorkerFactory>,
        processor: Arc<dyn TaskProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_clock(pool, work, workers, processor, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pool: Arc<AccountPool>,
        work: Arc<dyn WorkRepository>,
        workers: Arc<dyn WorkerFactory>,
        processor: Arc<dyn TaskProcessor>,
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let max_concurrent = config.max_concurrent_missions.max(1);
        Self {
            deps: MissionDeps {
                pool,
                work,
                workers,
                processor,
                clock,
            },
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            session_counter: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.deps.pool
    }

    /// Number of sessions started so far.
    pub fn sessions_run(&self) -> u64 {
        self.session_counter.load(Ordering::Relaxed)
    }

    /// Process every outstanding mission group once.
    ///
    /// Only a failure to list work is returned as an error. Per-mission failures
    /// are recorded in the summary and never abort sibling missions.
    pub async fn run_session(&self) -> Result<SessionSummary> {
        let session_number = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();

        let groups = self.deps.work.get_active_work_grouped_by_mission().await?;
        if groups.is_empty() {
            info!(session = session_number, "No outstanding work");
            return Ok(SessionSummary::new(
                session_number,
                Vec::new(),
                started.elapsed().as_secs_f64(),
            ));
        }

        info!(
            session = session_number,
            missions = groups.len(),
            max_concurrent = self.max_concurrent,
            "Session starting"
        );

        let mut tasks = JoinSet::new();
        for (index, (mission_key, items)) in groups.into_iter().enumerate() {
            let deps = self.deps.clone();
            let semaphore = Arc::clone(&self.semaphore);
            tasks.spawn(async move {
                let key = mission_key.clone();
                let item_ids = item_ids(&items);
                let result = AssertUnwindSafe(run_mission(
                    deps,
                    semaphore,
                    session_number,
                    mission_key,
                    items,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!(mission = %key, error = %message, "Mission task panicked");
                    MissionResult {
                        mission_key: key,
                        status: MissionStatus::Error,
                        result: None,
                        account_id: None,
                        error: Some(message),
                        item_ids,
                    }
                });
                (index, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => {
                    error!(session = session_number, error = %e, "Mission task failed to join")
                }
            }
        }
        results.sort_by_key(|(index, _)| *index);
        let missions: Vec<MissionResult> = results.into_iter().map(|(_, r)| r).collect();

        let summary = SessionSummary::new(
            session_number,
            missions,
            started.elapsed().as_secs_f64(),
        );
        info!(
            session = session_number,
            missions = summary.missions_processed,
            completed = summary.count(MissionStatus::Completed),
            no_account = summary.count(MissionStatus::NoAccount),
            errors = summary.count(MissionStatus::Error),
            duration_secs = summary.duration_seconds,
            "Session finished"
        );
        Ok(summary)
    }
}

async fn run_mission(
    deps: MissionDeps,
    semaphore: Arc<Semaphore>,
    session_number: u64,
    mission_key: String,
    items: Vec<WorkItem>,
) -> MissionResult {
    let item_ids = item_ids(&items);
    let mut result = MissionResult {
        mission_key: mission_key.clone(),
        status: MissionStatus::Error,
        result: None,
        account_id: None,
        error: None,
        item_ids,
    };

    // Held until this function returns, on every path.
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };

    let account = match deps.pool.acquire().await {
        Ok(Some(account)) => account,
        Ok(None) => {
            info!(mission = %mission_key, "No account available");
            result.status = MissionStatus::NoAccount;
            return result;
        }
        Err(e) => {
            error!(mission = %mission_key, error = %e, "Account acquisition failed");
            result.error = Some(e.to_string());
            return result;
        }
    };
    result.account_id = Some(account.id.clone());
    info!(mission = %mission_key, account_id = %account.id, "Mission starting");

    let started_at = deps.clock.now_millis();
    let processed =
        process_with_worker(&deps, session_number, &mission_key, &account, &items).await;

    let (outcome, status, error_message) = match processed {
        Ok(outcome) => {
            let reason = outcome.reason().map(str::to_string);
            (outcome, MissionStatus::Completed, reason)
        }
        Err(message) => (
            TaskOutcome::RecoverableFailure(message.clone()),
            MissionStatus::Error,
            Some(message),
        ),
    };

    let usage = UsageRecord {
        account_id: account.id.clone(),
        mission_key: mission_key.clone(),
        session_number,
        outcome: outcome.label().to_string(),
        started_at,
        completed_at: deps.clock.now_millis(),
        item_ids: result.item_ids.clone(),
        error: error_message.clone(),
    };
    // A panicking usage sink must not keep the account out of the pool.
    match AssertUnwindSafe(deps.work.log_usage(usage))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(
            mission = %mission_key,
            account_id = %account.id,
            error = %e,
            "Failed to log usage"
        ),
        Err(panic) => error!(
            mission = %mission_key,
            account_id = %account.id,
            error = %panic_message(panic.as_ref()),
            "Usage logging panicked"
        ),
    }

    let release_outcome = outcome.release_outcome();
    match deps
        .pool
        .release(&account.id, release_outcome, error_message.as_deref())
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(account_id = %account.id, "Account was not in use at release"),
        Err(e) => error!(account_id = %account.id, error = %e, "Account release failed"),
    }

    info!(
        mission = %mission_key,
        account_id = %account.id,
        outcome = outcome.label(),
        "Mission finished"
    );
    result.status = status;
    result.result = Some(release_outcome.label().to_string());
    result.error = error_message;
    result
}

/// Create, start and run a worker, then close it no matter what happened.
///
/// Errors and processor panics come back as a message; the caller treats them
/// as a recoverable failure of the account.
async fn process_with_worker(
    deps: &MissionDeps,
    session_number: u64,
    mission_key: &str,
    account: &Account,
    items: &[WorkItem],
) -> std::result::Result<TaskOutcome, String> {
    let context = MissionContext {
        mission_key: mission_key.to_string(),
        session_number,
        item_count: items.len(),
    };
    let mut worker = match deps.workers.create(&context).await {
        Ok(worker) => worker,
        Err(e) => {
            error!(mission = %mission_key, error = %e, "Worker creation failed");
            return Err(e.to_string());
        }
    };
    debug!(mission = %mission_key, worker_id = %worker.context().id, "Worker created");

    let run = AssertUnwindSafe(async {
        worker.start().await?;
        deps.processor.process(worker.as_mut(), account, items).await
    })
    .catch_unwind()
    .await;

    let processed = match run {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => {
            warn!(mission = %mission_key, account_id = %account.id, error = %e, "Mission failed");
            Err(e.to_string())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                mission = %mission_key,
                account_id = %account.id,
                error = %message,
                "Task processor panicked"
            );
            Err(format!("processor panicked: {message}"))
        }
    };

    let worker_id = worker.context().id.clone();
    match AssertUnwindSafe(worker.close()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(mission = %mission_key, %worker_id, error = %e, "Worker close failed"),
        Err(panic) => error!(
            mission = %mission_key,
            %worker_id,
            error = %panic_message(panic.as_ref()),
            "Worker close panicked"
        ),
    }
    processed
}

fn item_ids(items: &[WorkItem]) -> Vec<String> {
    items.iter().map(|item| item.id.clone()).collect()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
