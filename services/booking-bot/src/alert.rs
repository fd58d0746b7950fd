//! Operator alerting
//!
//! Alerts are fire-and-forget from the loop's point of view: the loop awaits
//! delivery with a timeout and only logs a failure.

use std::future::Future;
use std::pin::Pin;

use tracing::{error, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Sessions paused but nothing failed
    Warning,
    Error,
    /// A recovery attempt failed and the breaker backoff escalated
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

pub trait Alerter: Send + Sync {
    fn send_alert<'a>(
        &'a self,
        message: &'a str,
        severity: Severity,
        metadata: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Emits alerts as structured log events at a level matching severity.
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn send_alert<'a>(
        &'a self,
        message: &'a str,
        severity: Severity,
        metadata: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let metadata = metadata.to_string();
            match severity {
                Severity::Warning => {
                    warn!(alert = true, severity = severity.label(), %metadata, "{message}")
                }
                Severity::Error | Severity::Critical => {
                    error!(alert = true, severity = severity.label(), %metadata, "{message}")
                }
            }
            Ok(())
        })
    }
}
