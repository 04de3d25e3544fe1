//! Hypervisor interface the lifecycle machine drives
//!
//! Implementations live in this crate (`SimulatedHypervisor`) and in
//! `vmsentry-vm` (`VirshHypervisor`).

use crate::error::VmSentryResult;
use crate::instance_config::{InstanceConfig, InterfaceConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Domain state as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Running,
    ShutOff,
    InShutdown,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainState::Running => write!(f, "running"),
            DomainState::ShutOff => write!(f, "shut off"),
            DomainState::InShutdown => write!(f, "in shutdown"),
        }
    }
}

/// What a domain is defined from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub cpu: String,
    pub ram: String,
    pub disk: PathBuf,
    pub interfaces: BTreeMap<String, InterfaceConfig>,
}

impl DomainSpec {
    pub fn from_config(name: &str, config: &InstanceConfig, instance_dir: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            cpu: config.vm_data.cpu.clone(),
            ram: config.vm_data.ram.clone(),
            disk: instance_dir.join(&config.vm_data.image),
            interfaces: config.vm_data.interfaces.clone(),
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// `None` when no domain with this name is defined
    async fn domain_state(&self, name: &str) -> VmSentryResult<Option<DomainState>>;

    async fn define(&self, spec: &DomainSpec) -> VmSentryResult<()>;

    async fn boot(&self, name: &str) -> VmSentryResult<()>;

    /// Ask the guest to power off; returns without waiting
    async fn request_shutdown(&self, name: &str) -> VmSentryResult<()>;

    /// Hard power-off
    async fn destroy(&self, name: &str) -> VmSentryResult<()>;

    async fn undefine(&self, name: &str) -> VmSentryResult<()>;

    /// Whether the guest console currently shows `prompt`
    async fn console_shows(&self, name: &str, prompt: &str) -> VmSentryResult<bool>;

    /// Short backend name for logs
    fn backend_type(&self) -> &'static str;
}
