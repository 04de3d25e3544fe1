pub mod abstractions;
pub mod adaptor;
pub mod archive;
pub mod cloud_init;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod instance_config;
pub mod instance_dir;
pub mod lifecycle;
pub mod oracle;
pub mod scenario;
pub mod simulation;
pub mod status_check;
pub mod store;

pub use abstractions::time::{Clock, SimulatedClock, SystemClock};
pub use adaptor::ServiceAdaptor;
pub use config::HarnessConfig;
pub use error::{VmSentryError, VmSentryResult};
pub use hypervisor::{DomainSpec, DomainState, Hypervisor};
pub use instance_config::{InstanceConfig, InterfaceConfig, StatusCheckPolicy};
pub use instance_dir::{DirOp, DirectoryJournal, FileContent, InstanceDirectory};
pub use lifecycle::{CommandOutcome, CommandStatus, LifecycleCommand, LifecycleMachine, VmInstance, VmState};
pub use scenario::{Scenario, ScenarioReport, ScenarioRunner, Step};
pub use status_check::{GuestProbe, Outcome, ProbeResult};
pub use store::{ImagePool, InstanceStore, MemoryInstanceStore};
