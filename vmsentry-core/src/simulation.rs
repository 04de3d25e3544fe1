//! In-memory hypervisor and guest probe
//!
//! Used by the scenario runner's simulated backend and by tests. Guests can
//! be told to ignore shutdown requests and to answer the status probe with
//! scripted HTTP codes.

use crate::error::{VmSentryError, VmSentryResult};
use crate::hypervisor::{DomainSpec, DomainState, Hypervisor};
use crate::status_check::{GuestProbe, ProbeResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::info;

#[derive(Debug, Clone)]
struct SimDomain {
    spec: DomainSpec,
    state: DomainState,
}

#[derive(Default)]
pub struct SimulatedHypervisor {
    domains: RwLock<HashMap<String, SimDomain>>,
    ignores_shutdown: RwLock<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    history: Mutex<Vec<String>>,
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the guest ignore graceful shutdown requests, as if its shutdown
    /// binary had been removed
    pub fn hang_shutdown(&self, name: &str, hang: bool) {
        let mut set = self.ignores_shutdown.write();
        if hang {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Fail the next `operation` ("define", "boot", "destroy", "undefine")
    pub fn fail_next(&self, operation: &str) {
        self.failing.lock().insert(operation.to_string());
    }

    /// Operations performed so far, as `"<op> <name>"`
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    /// How many times `operation` was performed on `name`
    pub fn count(&self, operation: &str, name: &str) -> usize {
        let entry = format!("{} {}", operation, name);
        self.history.lock().iter().filter(|h| **h == entry).count()
    }

    pub fn spec(&self, name: &str) -> Option<DomainSpec> {
        self.domains.read().get(name).map(|d| d.spec.clone())
    }

    fn record(&self, operation: &str, name: &str) -> VmSentryResult<()> {
        if self.failing.lock().remove(operation) {
            return Err(VmSentryError::vm_operation(
                operation,
                format!("injected failure for domain '{}'", name),
            ));
        }
        self.history.lock().push(format!("{} {}", operation, name));
        Ok(())
    }

    fn set_state(&self, name: &str, state: DomainState) -> VmSentryResult<()> {
        let mut domains = self.domains.write();
        let domain = domains.get_mut(name).ok_or_else(|| VmSentryError::InstanceNotFound {
            name: name.to_string(),
        })?;
        domain.state = state;
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    async fn domain_state(&self, name: &str) -> VmSentryResult<Option<DomainState>> {
        Ok(self.domains.read().get(name).map(|d| d.state))
    }

    async fn define(&self, spec: &DomainSpec) -> VmSentryResult<()> {
        self.record("define", &spec.name)?;
        info!("Simulated: Defining domain '{}'", spec.name);
        self.domains.write().insert(
            spec.name.clone(),
            SimDomain {
                spec: spec.clone(),
                state: DomainState::ShutOff,
            },
        );
        Ok(())
    }

    async fn boot(&self, name: &str) -> VmSentryResult<()> {
        self.record("boot", name)?;
        info!("Simulated: Booting domain '{}'", name);
        self.set_state(name, DomainState::Running)
    }

    async fn request_shutdown(&self, name: &str) -> VmSentryResult<()> {
        self.record("shutdown", name)?;
        if self.ignores_shutdown.read().contains(name) {
            info!("Simulated: Domain '{}' ignores shutdown request", name);
            return Ok(());
        }
        info!("Simulated: Shutting down domain '{}'", name);
        self.set_state(name, DomainState::ShutOff)
    }

    async fn destroy(&self, name: &str) -> VmSentryResult<()> {
        self.record("destroy", name)?;
        info!("Simulated: Destroying domain '{}'", name);
        self.set_state(name, DomainState::ShutOff)
    }

    async fn undefine(&self, name: &str) -> VmSentryResult<()> {
        self.record("undefine", name)?;
        info!("Simulated: Undefining domain '{}'", name);
        self.domains
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| VmSentryError::InstanceNotFound {
                name: name.to_string(),
            })
    }

    async fn console_shows(&self, name: &str, _prompt: &str) -> VmSentryResult<bool> {
        Ok(matches!(
            self.domains.read().get(name).map(|d| d.state),
            Some(DomainState::Running)
        ))
    }

    fn backend_type(&self) -> &'static str {
        "simulated"
    }
}

#[derive(Default)]
struct ProbeScript {
    queued: VecDeque<Option<ProbeResult>>,
    fallback: Option<ProbeResult>,
    calls: usize,
}

/// Guest probe answering from per-address scripts
///
/// Queued answers are consumed first, then the fallback repeats. Unknown
/// addresses never answer.
#[derive(Default)]
pub struct ScriptedProbe {
    scripts: Mutex<HashMap<String, ProbeScript>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every probe of `ip` with `response`
    pub fn respond(&self, ip: &str, response: Option<ProbeResult>) {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(ip.to_string()).or_default();
        script.queued.clear();
        script.fallback = response;
    }

    /// Queue one-shot answers for `ip` ahead of the fallback
    pub fn script(&self, ip: &str, responses: Vec<Option<ProbeResult>>) {
        let mut scripts = self.scripts.lock();
        scripts
            .entry(ip.to_string())
            .or_default()
            .queued
            .extend(responses);
    }

    pub fn calls(&self, ip: &str) -> usize {
        self.scripts.lock().get(ip).map_or(0, |s| s.calls)
    }

    pub fn total_calls(&self) -> usize {
        self.scripts.lock().values().map(|s| s.calls).sum()
    }
}

#[async_trait]
impl GuestProbe for ScriptedProbe {
    async fn probe(&self, ip_address: &str) -> Option<ProbeResult> {
        let mut scripts = self.scripts.lock();
        let script = scripts.entry(ip_address.to_string()).or_default();
        script.calls += 1;
        match script.queued.pop_front() {
            Some(answer) => answer,
            None => script.fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec(name: &str) -> DomainSpec {
        DomainSpec {
            name: name.to_string(),
            cpu: "2".to_string(),
            ram: "256M".to_string(),
            disk: PathBuf::from("/tmp/rhel.img"),
            interfaces: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let hv = SimulatedHypervisor::new();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), None);

        hv.define(&spec("vm1")).await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), Some(DomainState::ShutOff));

        hv.boot("vm1").await.unwrap();
        assert!(hv.console_shows("vm1", "login:").await.unwrap());

        hv.request_shutdown("vm1").await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), Some(DomainState::ShutOff));

        hv.undefine("vm1").await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), None);
        assert_eq!(
            hv.history(),
            vec!["define vm1", "boot vm1", "shutdown vm1", "undefine vm1"]
        );
    }

    #[tokio::test]
    async fn test_hung_guest_ignores_shutdown() {
        let hv = SimulatedHypervisor::new();
        hv.define(&spec("vm1")).await.unwrap();
        hv.boot("vm1").await.unwrap();
        hv.hang_shutdown("vm1", true);

        hv.request_shutdown("vm1").await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), Some(DomainState::Running));

        hv.destroy("vm1").await.unwrap();
        assert_eq!(hv.domain_state("vm1").await.unwrap(), Some(DomainState::ShutOff));
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let hv = SimulatedHypervisor::new();
        hv.fail_next("define");
        assert!(hv.define(&spec("vm1")).await.is_err());
        assert!(hv.define(&spec("vm1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_probe_queue_then_fallback() {
        let probe = ScriptedProbe::new();
        probe.respond("10.0.0.1", Some(ProbeResult::OK));
        probe.script("10.0.0.1", vec![Some(ProbeResult::UNAVAILABLE)]);

        assert_eq!(probe.probe("10.0.0.1").await, Some(ProbeResult::UNAVAILABLE));
        assert_eq!(probe.probe("10.0.0.1").await, Some(ProbeResult::OK));
        assert_eq!(probe.probe("10.0.0.2").await, None);
        assert_eq!(probe.calls("10.0.0.1"), 2);
        assert_eq!(probe.total_calls(), 3);
    }
}
