//! Account record, derived status and release outcomes

use std::fmt;
use std::str::FromStr;

use common::Secret;
use serde::Deserialize;

use crate::error::Error;

/// One reusable credentialed account.
///
/// Timestamps are unix milliseconds. Status is never stored; it is derived from
/// `in_use`, `is_active` and the cooldown/quarantine deadlines via `status(now)`.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    /// Opaque reference to credentials held encrypted elsewhere.
    pub credential_ref: Secret<String>,
    pub in_use: bool,
    pub last_used_at: Option<u64>,
    pub cooldown_until: Option<u64>,
    pub quarantine_until: Option<u64>,
    pub consecutive_failures: u32,
    pub total_uses: u64,
    pub is_active: bool,
}

impl Account {
    /// Fresh, never-used, active account.
    pub fn new(id: impl Into<String>, credential_ref: impl Into<Secret<String>>) -> Self {
        Self {
            id: id.into(),
            credential_ref: credential_ref.into(),
            in_use: false,
            last_used_at: None,
            cooldown_until: None,
            quarantine_until: None,
            consecutive_failures: 0,
            total_uses: 0,
            is_active: true,
        }
    }

    /// Derived status at `now`.
    ///
    /// Precedence: inactive, in use, quarantined, cooldown, available.
    pub fn status(&self, now: u64) -> AccountStatus {
        if !self.is_active {
            return AccountStatus::Inactive;
        }
        if self.in_use {
            return AccountStatus::InUse;
        }
        if let Some(until) = self.quarantine_until.filter(|&t| t > now) {
            return AccountStatus::Quarantined { until };
        }
        if let Some(until) = self.cooldown_until.filter(|&t| t > now) {
            return AccountStatus::Cooldown { until };
        }
        AccountStatus::Available
    }

    pub fn is_selectable(&self, now: u64) -> bool {
        matches!(self.status(now), AccountStatus::Available)
    }

    /// Latest future deadline blocking this account, if any.
    pub fn blocked_until(&self, now: u64) -> Option<u64> {
        [self.cooldown_until, self.quarantine_until]
            .into_iter()
            .flatten()
            .filter(|&t| t > now)
            .max()
    }
}

/// Derived runtime status of an account.
///
/// Transitions:
/// - Available → InUse (acquire)
/// - InUse → Cooldown (success / no capacity)
/// - InUse → Available (transient failure below threshold)
/// - InUse → Quarantined (failure threshold reached, or banned)
/// - Cooldown/Quarantined → Available (deadline passes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Available,
    InUse,
    Cooldown { until: u64 },
    Quarantined { until: u64 },
    Inactive,
}

impl AccountStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Available => "available",
            AccountStatus::InUse => "in_use",
            AccountStatus::Cooldown { .. } => "cooldown",
            AccountStatus::Quarantined { .. } => "quarantined",
            AccountStatus::Inactive => "inactive",
        }
    }
}

/// What happened while an account was in use, reported on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Work completed.
    Success,
    /// Work ran but the target had nothing to offer; the account still did a full visit.
    NoCapacity,
    /// Recoverable failure, counted toward quarantine.
    TransientFailure,
    /// Terminal signal (credential banned/locked); extended quarantine.
    Banned,
}

impl ReleaseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReleaseOutcome::Success => "success",
            ReleaseOutcome::NoCapacity => "no_capacity",
            ReleaseOutcome::TransientFailure => "transient_failure",
            ReleaseOutcome::Banned => "banned",
        }
    }
}

impl fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ReleaseOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ReleaseOutcome::Success),
            "no_capacity" => Ok(ReleaseOutcome::NoCapacity),
            "transient_failure" => Ok(ReleaseOutcome::TransientFailure),
            "banned" => Ok(ReleaseOutcome::Banned),
            other => Err(Error::InvalidOutcome(other.to_string())),
        }
    }
}

/// Entry in the accounts seed file.
#[derive(Deserialize)]
pub struct AccountSeed {
    pub id: String,
    pub credential_ref: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl From<AccountSeed> for Account {
    fn from(seed: AccountSeed) -> Self {
        let mut account = Account::new(seed.id, seed.credential_ref);
        account.is_active = seed.is_active;
        account
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn fresh_account_is_available() {
        let account = Account::new("a", "ref-a");
        assert_eq!(account.status(NOW), AccountStatus::Available);
        assert!(account.is_selectable(NOW));
    }

    #[test]
    fn status_precedence() {
        let mut account = Account::new("a", "ref-a");
        account.cooldown_until = Some(NOW + 10);
        account.quarantine_until = Some(NOW + 5);
        assert_eq!(account.status(NOW), AccountStatus::Quarantined { until: NOW + 5 });

        account.in_use = true;
        assert_eq!(account.status(NOW), AccountStatus::InUse);

        account.is_active = false;
        assert_eq!(account.status(NOW), AccountStatus::Inactive);
    }

    #[test]
    fn past_deadlines_do_not_block() {
        let mut account = Account::new("a", "ref-a");
        account.cooldown_until = Some(NOW - 1);
        account.quarantine_until = Some(NOW);
        assert!(account.is_selectable(NOW));
        assert_eq!(account.blocked_until(NOW), None);
    }

    #[test]
    fn blocked_until_takes_latest_future_deadline() {
        let mut account = Account::new("a", "ref-a");
        account.cooldown_until = Some(NOW + 100);
        account.quarantine_until = Some(NOW + 50);
        assert_eq!(account.blocked_until(NOW), Some(NOW + 100));
    }

    #[test]
    fn outcome_parses_closed_set() {
        for outcome in [
            ReleaseOutcome::Success,
            ReleaseOutcome::NoCapacity,
            ReleaseOutcome::TransientFailure,
            ReleaseOutcome::Banned,
        ] {
            assert_eq!(outcome.label().parse::<ReleaseOutcome>().unwrap(), outcome);
        }
    }

    #[test]
    fn unknown_outcome_is_invalid_argument() {
        let err = "login_fail".parse::<ReleaseOutcome>().unwrap_err();
        assert!(matches!(err, Error::InvalidOutcome(ref s) if s == "login_fail"));
    }

    #[test]
    fn seed_defaults_to_active() {
        let seed: AccountSeed =
            serde_json::from_str(r#"{"id":"a","credential_ref":"vault://a"}"#).unwrap();
        let account = Account::from(seed);
        assert!(account.is_active);
        assert_eq!(account.credential_ref.expose(), "vault://a");
    }
}
