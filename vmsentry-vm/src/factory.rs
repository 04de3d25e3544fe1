//! Backend selection
//!
//! A backend is the set of collaborators the lifecycle machine needs: a
//! hypervisor, a guest probe, an instance store and a clock. Factories build
//! one from the harness configuration and register under a short name so
//! the CLI can pick with `--backend`.

use crate::http_probe::HttpStatusProbe;
use crate::node::{LocalNode, Node};
use crate::node_store::NodeInstanceStore;
use crate::virsh::VirshHypervisor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use vmsentry_core::abstractions::time::{Clock, SimulatedClock, SystemClock};
use vmsentry_core::config::HarnessConfig;
use vmsentry_core::error::{VmSentryError, VmSentryResult};
use vmsentry_core::hypervisor::Hypervisor;
use vmsentry_core::lifecycle::LifecycleMachine;
use vmsentry_core::scenario::{ScenarioRunner, SimulationControls};
use vmsentry_core::simulation::{ScriptedProbe, SimulatedHypervisor};
use vmsentry_core::status_check::GuestProbe;
use vmsentry_core::store::{InstanceStore, MemoryInstanceStore};
use vmsentry_core::ServiceAdaptor;

pub struct Backend {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub probe: Arc<dyn GuestProbe>,
    pub store: Arc<dyn InstanceStore>,
    pub clock: Arc<dyn Clock>,
    /// Set when the backend is in-memory and can be scripted by scenario steps
    pub simulation: Option<SimulationControls>,
}

impl Backend {
    pub fn into_adaptor(self, config: HarnessConfig) -> (Arc<ServiceAdaptor>, Option<SimulationControls>) {
        let machine = LifecycleMachine::new(
            Arc::new(config),
            self.hypervisor,
            self.probe,
            self.store.clone(),
            self.clock,
        );
        (Arc::new(ServiceAdaptor::new(machine, self.store)), self.simulation)
    }

    pub fn into_runner(self, config: HarnessConfig) -> ScenarioRunner {
        match self.into_adaptor(config) {
            (adaptor, Some(simulation)) => ScenarioRunner::with_simulation(adaptor, simulation),
            (adaptor, None) => ScenarioRunner::new(adaptor),
        }
    }
}

/// Builds a [`Backend`] from harness configuration
pub trait BackendFactory: Send + Sync {
    fn create_backend(&self, config: &HarnessConfig) -> VmSentryResult<Backend>;

    fn backend_type(&self) -> &'static str;

    fn description(&self) -> &'static str;
}

/// Named backend factories
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the simulated backend over `pool_images` and the virsh
    /// backend driving `node`
    pub fn standard(node: Arc<dyn Node>, pool_images: Vec<String>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SimulatedBackendFactory::new(pool_images)));
        registry.register(Arc::new(VirshBackendFactory::new(node)));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        let backend_type = factory.backend_type().to_string();
        info!(backend = %backend_type, description = factory.description(), "Registering backend");
        self.factories.insert(backend_type, factory);
    }

    pub fn create_backend(&self, backend_type: &str, config: &HarnessConfig) -> VmSentryResult<Backend> {
        let factory = self.factories.get(backend_type).ok_or_else(|| {
            VmSentryError::ConfigError(format!(
                "Unknown backend type '{}'. Available backends: {:?}",
                backend_type,
                self.list_available_backends()
            ))
        })?;
        factory.create_backend(config)
    }

    pub fn list_available_backends(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::standard(Arc::new(LocalNode::new()), Vec::new())
    }
}

/// In-memory hypervisor, scripted probe and memory store on a simulated clock
pub struct SimulatedBackendFactory {
    pool_images: Vec<String>,
}

impl SimulatedBackendFactory {
    pub fn new(pool_images: Vec<String>) -> Self {
        Self { pool_images }
    }
}

impl BackendFactory for SimulatedBackendFactory {
    fn create_backend(&self, _config: &HarnessConfig) -> VmSentryResult<Backend> {
        let controls = SimulationControls {
            hypervisor: Arc::new(SimulatedHypervisor::new()),
            probe: Arc::new(ScriptedProbe::new()),
            store: Arc::new(MemoryInstanceStore::with_images(self.pool_images.iter().cloned())),
        };
        Ok(Backend {
            hypervisor: controls.hypervisor.clone(),
            probe: controls.probe.clone(),
            store: controls.store.clone(),
            clock: Arc::new(SimulatedClock::default()),
            simulation: Some(controls),
        })
    }

    fn backend_type(&self) -> &'static str {
        "simulated"
    }

    fn description(&self) -> &'static str {
        "In-memory hypervisor and scripted guests on a simulated clock"
    }
}

/// virsh on a node, instance directories on its filesystem, HTTP status probe
pub struct VirshBackendFactory {
    node: Arc<dyn Node>,
}

impl VirshBackendFactory {
    pub fn new(node: Arc<dyn Node>) -> Self {
        Self { node }
    }
}

impl BackendFactory for VirshBackendFactory {
    fn create_backend(&self, config: &HarnessConfig) -> VmSentryResult<Backend> {
        Ok(Backend {
            hypervisor: Arc::new(VirshHypervisor::new(self.node.clone())),
            probe: Arc::new(HttpStatusProbe::new(&config.probe)?),
            store: Arc::new(NodeInstanceStore::from_config(self.node.clone(), config)),
            clock: Arc::new(SystemClock::new()),
            simulation: None,
        })
    }

    fn backend_type(&self) -> &'static str {
        "virsh"
    }

    fn description(&self) -> &'static str {
        "libvirt domains through virsh on a local or ssh node"
    }
}
