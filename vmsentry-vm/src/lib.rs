//! Real-node backends for the vmsentry lifecycle machine
//!
//! Commands reach a node through [`node::Node`], either locally or over ssh.
//! On top of that sit the virsh hypervisor, the on-disk instance store and
//! the HTTP status probe. [`factory::BackendRegistry`] wires them together.

pub mod factory;
pub mod http_probe;
pub mod node;
pub mod node_store;
pub mod packages;
pub mod virsh;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock_node;

pub use factory::{Backend, BackendFactory, BackendRegistry, SimulatedBackendFactory, VirshBackendFactory};
pub use http_probe::HttpStatusProbe;
pub use node::{CommandResult, LocalNode, Node, SshNode};
pub use node_store::NodeInstanceStore;
pub use virsh::VirshHypervisor;

// Re-export core types for convenience
pub use vmsentry_core::{
    error::{VmSentryError, VmSentryResult},
    HarnessConfig, Hypervisor, ServiceAdaptor,
};
