//! Lifecycle timing and internal status probe configuration

use super::defaults::*;
use super::parse_duration_secs_from_env;
use crate::error::{VmSentryError, VmSentryResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Harness-wide lifecycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Graceful shutdown bound for `stop` and for `stop-undefine` without `--stop-timeout`
    #[serde(with = "humantime_serde")]
    pub default_stop_timeout: Duration,

    /// Delay between internal status probes
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long scenarios wait for the console login prompt
    #[serde(with = "humantime_serde")]
    pub boot_wait: Duration,

    /// Console line that marks a booted guest
    pub console_prompt: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            default_stop_timeout: Duration::from_secs(DEFAULT_STOP_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            boot_wait: Duration::from_secs(DEFAULT_BOOT_WAIT_SECS),
            console_prompt: DEFAULT_CONSOLE_PROMPT.to_string(),
        }
    }
}

impl LifecycleConfig {
    pub fn with_env_overrides(mut self) -> VmSentryResult<Self> {
        self.default_stop_timeout = parse_duration_secs_from_env(
            "VMSENTRY_DEFAULT_STOP_TIMEOUT_SECS",
            self.default_stop_timeout,
        );
        self.poll_interval =
            parse_duration_secs_from_env("VMSENTRY_POLL_INTERVAL_SECS", self.poll_interval);
        self.boot_wait = parse_duration_secs_from_env("VMSENTRY_BOOT_WAIT_SECS", self.boot_wait);
        if let Ok(prompt) = std::env::var("VMSENTRY_CONSOLE_PROMPT") {
            self.console_prompt = prompt;
        }
        Ok(self)
    }

    pub fn validate(&self) -> VmSentryResult<()> {
        if self.poll_interval.is_zero() {
            return Err(VmSentryError::ConfigError(
                "lifecycle.poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.default_stop_timeout.is_zero() {
            return Err(VmSentryError::ConfigError(
                "lifecycle.default_stop_timeout must be greater than zero".to_string(),
            ));
        }
        if self.console_prompt.trim().is_empty() {
            return Err(VmSentryError::ConfigError(
                "lifecycle.console_prompt must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Internal status probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Port the guest status endpoint listens on
    pub port: u16,

    /// HTTP path of the status endpoint
    pub path: String,

    /// Per-request timeout; a request that times out counts as "no response"
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROBE_PORT,
            path: DEFAULT_PROBE_PATH.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_PROBE_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl ProbeConfig {
    pub fn with_env_overrides(mut self) -> VmSentryResult<Self> {
        if let Ok(val) = std::env::var("VMSENTRY_PROBE_PORT") {
            self.port = val.parse().map_err(|_| {
                VmSentryError::ConfigError(format!("Invalid VMSENTRY_PROBE_PORT: {}", val))
            })?;
        }
        if let Ok(path) = std::env::var("VMSENTRY_PROBE_PATH") {
            self.path = path;
        }
        self.request_timeout = parse_duration_secs_from_env(
            "VMSENTRY_PROBE_REQUEST_TIMEOUT_SECS",
            self.request_timeout,
        );
        Ok(self)
    }

    pub fn validate(&self) -> VmSentryResult<()> {
        if self.port == 0 {
            return Err(VmSentryError::ConfigError(
                "probe.port must be non-zero".to_string(),
            ));
        }
        if !self.path.starts_with('/') {
            return Err(VmSentryError::ConfigError(format!(
                "probe.path must start with '/', got '{}'",
                self.path
            )));
        }
        Ok(())
    }
}
