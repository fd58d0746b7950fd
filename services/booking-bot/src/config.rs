//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (admin token, Redis URL) come from env vars or side files and are
//! never stored in the TOML directly.

use account_pool::PoolConfig;
use circuit_breaker::BreakerConfig;
use common::Secret;
use serde::Deserialize;
use session::OrchestratorConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::LoopConfig;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub pool: PoolSection,
    pub session: SessionSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub admin: AdminSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

/// Account pool settings
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    /// JSON array of `{id, credential_ref, is_active}` seeds
    pub accounts_file: PathBuf,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_quarantine")]
    pub quarantine_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

/// Session and adapter settings
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_missions: usize,
    pub work_file: PathBuf,
    pub usage_log: PathBuf,
    pub worker_root: PathBuf,
    /// Program and arguments of the task processor adapter
    pub processor_command: Vec<String>,
    #[serde(default = "default_processor_timeout")]
    pub processor_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub error_window_secs: u64,
    pub max_errors_in_window: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub half_open_threshold: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            error_window_secs: defaults.error_window.as_secs(),
            max_errors_in_window: defaults.max_errors_in_window,
            backoff_base_secs: defaults.backoff_base.as_secs(),
            backoff_max_secs: defaults.backoff_max.as_secs(),
            half_open_threshold: defaults.half_open_threshold,
        }
    }
}

/// Control loop timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlSection {
    /// Fixed wait after a failed session while the breaker stays closed
    pub recovery_interval_secs: u64,
    /// Upper bound of the random jitter added to the recovery wait
    pub recovery_jitter_secs: u64,
    /// Wait after a failed health check
    pub health_recovery_interval_secs: u64,
    pub account_wait_timeout_secs: u64,
    /// Interval between sessions outside peak hours
    pub base_interval_secs: u64,
    pub peak_interval_secs: u64,
    /// UTC hours (0..24) during which `peak_interval_secs` applies
    pub peak_hours: Vec<u8>,
    pub alert_timeout_secs: u64,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            recovery_interval_secs: 300,
            recovery_jitter_secs: 60,
            health_recovery_interval_secs: 120,
            account_wait_timeout_secs: 1800,
            base_interval_secs: 900,
            peak_interval_secs: 300,
            peak_hours: Vec::new(),
            alert_timeout_secs: 10,
        }
    }
}

/// Operator API settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdminSection {
    pub listen_addr: SocketAddr,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Path to a file containing the admin token (alternative to BOT_ADMIN_TOKEN)
    pub token_file: Option<PathBuf>,
    pub auth_max_attempts: u32,
    pub auth_window_secs: u64,
    pub max_connections: usize,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            token: None,
            token_file: None,
            auth_max_attempts: 5,
            auth_window_secs: 300,
            max_connections: 64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Redis URL; overridden by RATE_LIMIT_REDIS_URL
    #[serde(deserialize_with = "deserialize_secret")]
    pub redis_url: Option<Secret<String>>,
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            redis_url: None,
            cleanup_interval_secs: 300,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<Secret<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.trim().is_empty()).map(Secret::new))
}

fn default_cooldown() -> u64 {
    600
}

fn default_quarantine() -> u64 {
    3600
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    3
}

fn default_processor_timeout() -> u64 {
    600
}

fn require_positive(name: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{name} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Admin token resolution order:
    /// 1. BOT_ADMIN_TOKEN env var
    /// 2. admin.token_file path from config
    ///
    /// Redis URL: RATE_LIMIT_REDIS_URL env var over rate_limit.redis_url.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var("BOT_ADMIN_TOKEN") {
            config.admin.token = Some(Secret::new(token));
        } else if let Some(ref token_file) = config.admin.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.admin.token = Some(Secret::new(token));
            }
        }

        if let Ok(url) = std::env::var("RATE_LIMIT_REDIS_URL")
            && !url.trim().is_empty()
        {
            config.rate_limit.redis_url = Some(Secret::new(url));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_positive("pool.cooldown_secs", self.pool.cooldown_secs)?;
        require_positive("pool.quarantine_secs", self.pool.quarantine_secs)?;
        require_positive("pool.max_failures", self.pool.max_failures.into())?;

        require_positive(
            "session.max_concurrent_missions",
            self.session.max_concurrent_missions as u64,
        )?;
        require_positive(
            "session.processor_timeout_secs",
            self.session.processor_timeout_secs,
        )?;
        if self
            .session
            .processor_command
            .first()
            .is_none_or(|program| program.trim().is_empty())
        {
            return Err(common::Error::Config(
                "session.processor_command must name a program".into(),
            ));
        }

        let b = &self.breaker;
        require_positive("breaker.failure_threshold", b.failure_threshold.into())?;
        require_positive("breaker.error_window_secs", b.error_window_secs)?;
        require_positive("breaker.max_errors_in_window", b.max_errors_in_window.into())?;
        require_positive("breaker.backoff_base_secs", b.backoff_base_secs)?;
        require_positive("breaker.half_open_threshold", b.half_open_threshold.into())?;
        if b.backoff_max_secs < b.backoff_base_secs {
            return Err(common::Error::Config(format!(
                "breaker.backoff_max_secs ({}) must be >= backoff_base_secs ({})",
                b.backoff_max_secs, b.backoff_base_secs
            )));
        }

        let c = &self.control;
        require_positive("control.recovery_interval_secs", c.recovery_interval_secs)?;
        require_positive(
            "control.health_recovery_interval_secs",
            c.health_recovery_interval_secs,
        )?;
        require_positive(
            "control.account_wait_timeout_secs",
            c.account_wait_timeout_secs,
        )?;
        require_positive("control.base_interval_secs", c.base_interval_secs)?;
        require_positive("control.peak_interval_secs", c.peak_interval_secs)?;
        require_positive("control.alert_timeout_secs", c.alert_timeout_secs)?;
        if let Some(hour) = c.peak_hours.iter().find(|h| **h >= 24) {
            return Err(common::Error::Config(format!(
                "control.peak_hours must be in 0..24, got: {hour}"
            )));
        }

        let a = &self.admin;
        require_positive("admin.auth_max_attempts", a.auth_max_attempts.into())?;
        require_positive("admin.auth_window_secs", a.auth_window_secs)?;
        require_positive("admin.max_connections", a.max_connections as u64)?;

        require_positive(
            "rate_limit.cleanup_interval_secs",
            self.rate_limit.cleanup_interval_secs,
        )?;
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("visa-booking-bot.toml")
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            cooldown: Duration::from_secs(self.pool.cooldown_secs),
            quarantine: Duration::from_secs(self.pool.quarantine_secs),
            max_failures: self.pool.max_failures,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        let b = &self.breaker;
        BreakerConfig {
            failure_threshold: b.failure_threshold,
            error_window: Duration::from_secs(b.error_window_secs),
            max_errors_in_window: b.max_errors_in_window,
            backoff_base: Duration::from_secs(b.backoff_base_secs),
            backoff_max: Duration::from_secs(b.backoff_max_secs),
            half_open_threshold: b.half_open_threshold,
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        let c = &self.control;
        LoopConfig {
            recovery_interval: Duration::from_secs(c.recovery_interval_secs),
            recovery_jitter: Duration::from_secs(c.recovery_jitter_secs),
            health_recovery_interval: Duration::from_secs(c.health_recovery_interval_secs),
            account_wait_timeout: Duration::from_secs(c.account_wait_timeout_secs),
            alert_timeout: Duration::from_secs(c.alert_timeout_secs),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_missions: self.session.max_concurrent_missions,
        }
    }
}
