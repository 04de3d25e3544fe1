//! Harness configuration for vmsentry
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `VMSENTRY_*` environment variables. `validate()` runs after every
//! load path.

use crate::error::{VmSentryError, VmSentryResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod defaults;
pub mod lifecycle;

pub use defaults::*;
pub use lifecycle::{LifecycleConfig, ProbeConfig};

/// Root configuration for the adaptor harness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Parent of every `<vm_name>/` instance directory
    pub instances_root: PathBuf,

    /// Shared image pool images are copied from on start
    pub images_root: PathBuf,

    /// File adaptor log lines are appended to
    pub adaptor_log: PathBuf,

    /// Lifecycle timing
    pub lifecycle: LifecycleConfig,

    /// Internal status probe settings
    pub probe: ProbeConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            instances_root: PathBuf::from(DEFAULT_INSTANCES_ROOT),
            images_root: PathBuf::from(DEFAULT_IMAGES_ROOT),
            adaptor_log: PathBuf::from(DEFAULT_ADAPTOR_LOG),
            lifecycle: LifecycleConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file, then validate it
    pub fn from_file(path: &Path) -> VmSentryResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VmSentryError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> VmSentryResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `VMSENTRY_*` overrides to an already loaded configuration
    pub fn with_env_overrides(mut self) -> VmSentryResult<Self> {
        if let Ok(root) = std::env::var("VMSENTRY_INSTANCES_ROOT") {
            self.instances_root = PathBuf::from(root);
        }
        if let Ok(root) = std::env::var("VMSENTRY_IMAGES_ROOT") {
            self.images_root = PathBuf::from(root);
        }
        if let Ok(log) = std::env::var("VMSENTRY_ADAPTOR_LOG") {
            self.adaptor_log = PathBuf::from(log);
        }

        self.lifecycle = self.lifecycle.with_env_overrides()?;
        self.probe = self.probe.with_env_overrides()?;

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> VmSentryResult<()> {
        if self.instances_root.as_os_str().is_empty() {
            return Err(VmSentryError::ConfigError(
                "instances_root must not be empty".to_string(),
            ));
        }
        if self.images_root.as_os_str().is_empty() {
            return Err(VmSentryError::ConfigError(
                "images_root must not be empty".to_string(),
            ));
        }

        self.lifecycle.validate()?;
        self.probe.validate()?;

        Ok(())
    }

    /// Directory holding the files of one VM service
    pub fn instance_dir(&self, vm_name: &str) -> PathBuf {
        self.instances_root.join(vm_name)
    }

    /// Configuration suitable for tests rooted at `root`
    pub fn test(root: &Path) -> Self {
        let mut config = Self::default();
        config.instances_root = root.join("instances");
        config.images_root = root.join("images");
        config.adaptor_log = root.join("adaptor.log");
        config.lifecycle.poll_interval = Duration::from_millis(10);
        config
    }
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
