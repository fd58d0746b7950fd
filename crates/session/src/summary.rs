//! Per-session results handed back to the caller

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    /// The processor ran and reported an outcome (which may itself be a failure).
    Completed,
    /// No account was free; nothing else was consumed.
    NoAccount,
    /// Worker setup or the processor raised.
    Error,
}

impl MissionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            MissionStatus::Completed => "completed",
            MissionStatus::NoAccount => "no_account",
            MissionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionResult {
    pub mission_key: String,
    pub status: MissionStatus,
    /// Outcome label the account was released with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub item_ids: Vec<String>,
}

/// Outcome of one `run_session` call. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_number: u64,
    pub missions_processed: usize,
    pub missions: Vec<MissionResult>,
    pub duration_seconds: f64,
}

impl SessionSummary {
    pub fn new(session_number: u64, missions: Vec<MissionResult>, duration_seconds: f64) -> Self {
        Self {
            session_number,
            missions_processed: missions.len(),
            missions,
            duration_seconds,
        }
    }

    pub fn count(&self, status: MissionStatus) -> usize {
        self.missions.iter().filter(|m| m.status == status).count()
    }

    pub fn is_empty(&self) -> bool {
        self.missions.is_empty()
    }
}
