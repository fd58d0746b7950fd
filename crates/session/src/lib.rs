//! Session orchestration over isolated workers and pooled accounts
//!
//! Defines the collaborator seams a session runs against, decoupling the
//! orchestration core from any site-specific automation:
//! - `WorkRepository` lists outstanding work grouped by mission and records usage
//! - `WorkerFactory` hands out a freshly isolated `Worker` per mission
//! - `TaskProcessor` runs one mission's items on one worker with one account
//!
//! `SessionOrchestrator::run_session` processes every mission group with
//! bounded concurrency and returns a `SessionSummary`.

pub mod error;
pub mod orchestrator;
pub mod summary;

pub use error::{Error, Result};
pub use orchestrator::{OrchestratorConfig, SessionOrchestrator};
pub use summary::{MissionResult, MissionStatus, SessionSummary};

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use account_pool::{Account, ReleaseOutcome};
use serde::{Deserialize, Serialize};

/// One outstanding job (e.g. one applicant's appointment request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Grouping key; all items sharing it run as one mission.
    pub mission_key: String,
    /// Adapter-specific data, opaque to the core.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Result of one mission as reported by the task processor.
///
/// The variant, not an error type, decides what happens to the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Items handled.
    Success,
    /// The target had no slots; the visit itself went fine.
    NoCapacity,
    /// Something went wrong that may clear up (timeouts, login hiccups, captcha).
    RecoverableFailure(String),
    /// The account must not be retried soon (banned, locked).
    TerminalFailure(String),
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::NoCapacity => "no_capacity",
            TaskOutcome::RecoverableFailure(_) => "recoverable_failure",
            TaskOutcome::TerminalFailure(_) => "terminal_failure",
        }
    }

    /// Pool transition implied by this outcome.
    pub fn release_outcome(&self) -> ReleaseOutcome {
        match self {
            TaskOutcome::Success => ReleaseOutcome::Success,
            TaskOutcome::NoCapacity => ReleaseOutcome::NoCapacity,
            TaskOutcome::RecoverableFailure(_) => ReleaseOutcome::TransientFailure,
            TaskOutcome::TerminalFailure(_) => ReleaseOutcome::Banned,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            TaskOutcome::RecoverableFailure(r) | TaskOutcome::TerminalFailure(r) => Some(r),
            _ => None,
        }
    }
}

/// Row written through `WorkRepository::log_usage` for every mission that held an account.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub account_id: String,
    pub mission_key: String,
    pub session_number: u64,
    pub outcome: String,
    /// Unix milliseconds
    pub started_at: u64,
    pub completed_at: u64,
    pub item_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outstanding work and usage history.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn WorkRepository>`).
pub trait WorkRepository: Send + Sync {
    /// Outstanding items keyed by mission. Missions run in key order.
    fn get_active_work_grouped_by_mission(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeMap<String, Vec<WorkItem>>>> + Send + '_>>;

    fn log_usage(
        &self,
        record: UsageRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// What a worker factory needs to know about the mission it serves.
#[derive(Debug, Clone)]
pub struct MissionContext {
    pub mission_key: String,
    pub session_number: u64,
    pub item_count: usize,
}

/// Identity of one isolated execution context.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    /// Unique per `create` call.
    pub id: String,
    pub mission_key: String,
    /// Private state directory (cookies, profile), if the worker keeps one.
    pub state_dir: Option<PathBuf>,
}

/// An isolated execution context: its own session, identity and network state.
pub trait Worker: Send {
    fn context(&self) -> &WorkerContext;

    fn start(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Tear down everything the worker created. Called exactly once per worker.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Creates workers. Every call must yield a worker sharing no state with any other.
pub trait WorkerFactory: Send + Sync {
    fn create<'a>(
        &'a self,
        mission: &'a MissionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Worker>>> + Send + 'a>>;
}

/// Runs one mission. All site-specific logic lives behind this call.
pub trait TaskProcessor: Send + Sync {
    fn process<'a>(
        &'a self,
        worker: &'a mut dyn Worker,
        account: &'a Account,
        items: &'a [WorkItem],
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_pool_transitions() {
        assert_eq!(TaskOutcome::Success.release_outcome(), ReleaseOutcome::Success);
        assert_eq!(TaskOutcome::NoCapacity.release_outcome(), ReleaseOutcome::NoCapacity);
        assert_eq!(
            TaskOutcome::RecoverableFailure("otp timeout".into()).release_outcome(),
            ReleaseOutcome::TransientFailure
        );
        assert_eq!(
            TaskOutcome::TerminalFailure("account locked".into()).release_outcome(),
            ReleaseOutcome::Banned
        );
    }

    #[test]
    fn reason_only_on_failures() {
        assert_eq!(TaskOutcome::Success.reason(), None);
        assert_eq!(
            TaskOutcome::TerminalFailure("locked".into()).reason(),
            Some("locked")
        );
    }

    #[test]
    fn work_item_payload_defaults_to_null() {
        let item: WorkItem =
            serde_json::from_str(r#"{"id":"w1","mission_key":"lisbon"}"#).unwrap();
        assert!(item.payload.is_null());
    }

    #[test]
    fn usage_record_omits_empty_error() {
        let record = UsageRecord {
            account_id: "a1".into(),
            mission_key: "lisbon".into(),
            session_number: 3,
            outcome: "success".into(),
            started_at: 1,
            completed_at: 2,
            item_ids: vec!["w1".into()],
            error: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["item_ids"][0], "w1");
    }
}
