//! Scripted lifecycle scenarios
//!
//! A [`Scenario`] is a list of [`Step`]s, written in Rust or loaded from
//! YAML. The [`ScenarioRunner`] drives a [`ServiceAdaptor`] through them and
//! checks the [`InvariantOracle`] after every lifecycle command.
//!
//! ```yaml
//! name: hung guest is force stopped
//! steps:
//!   - stage_config: { instance: vm1, config: { vm_data: { cpu: "2", ram: 256M, image: rhel.img } } }
//!   - run: { instance: vm1, command: start }
//!   - hang_shutdown: { instance: vm1 }
//!   - run: { instance: vm1, command: "stop-undefine --stop-timeout=33" }
//!   - expect_log: { instance: vm1, contains: calling force-stop }
//! ```

use crate::abstractions::time::SimulatedClock;
use crate::adaptor::ServiceAdaptor;
use crate::cloud_init::{meta_data_lines, network_config_lines, StaticInterface};
use crate::config::defaults::*;
use crate::config::HarnessConfig;
use crate::error::{VmSentryError, VmSentryResult};
use crate::instance_config::InstanceConfig;
use crate::lifecycle::{CommandOutcome, LifecycleCommand, LifecycleMachine};
use crate::oracle::{InvariantOracle, Violation};
use crate::simulation::{ScriptedProbe, SimulatedHypervisor};
use crate::status_check::ProbeResult;
use crate::store::MemoryInstanceStore;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Write `config.json`
    StageConfig { instance: String, config: InstanceConfig },
    /// Write `meta-data` and `network-config` for a static `eth0`
    StageCloudInit {
        instance: String,
        address: String,
        netmask: String,
        #[serde(default = "default_mac")]
        mac_address: String,
    },
    /// Write an arbitrary file, e.g. `user-data`
    StageFile {
        instance: String,
        file: String,
        lines: Vec<String>,
    },
    /// Run a lifecycle command and compare its exit code
    Run {
        instance: String,
        command: String,
        #[serde(default)]
        expect: i32,
    },
    /// Wait for the console login prompt
    WaitForBoot { instance: String },
    /// Point `vm_data.image` at another pool image
    SetImage { instance: String, image: String },
    /// Delete `last_undefined_vm/`
    RemoveArchive { instance: String },
    /// Put an image into the simulated pool
    AddImage { image: String },
    /// Script the simulated guest's status endpoint; `null` means silence
    GuestResponds { ip: String, status: Option<u16> },
    /// Make the simulated guest ignore graceful shutdown
    HangShutdown {
        instance: String,
        #[serde(default = "default_true")]
        hang: bool,
    },
    /// Archive holds `<file>-<timestamp>` for each named file, and nothing else when `exact`
    ExpectArchive {
        instance: String,
        files: Vec<String>,
        #[serde(default)]
        exact: bool,
    },
    /// `last_undefined_vm/` does not exist
    ExpectNoArchive { instance: String },
    /// Last command's log for `instance` contains (or lacks) a substring
    ExpectLog {
        instance: String,
        contains: String,
        #[serde(default)]
        absent: bool,
    },
    /// Guest status endpoint was probed this many times in total
    ExpectProbeCalls { ip: String, calls: usize },
}

fn default_mac() -> String {
    "52:54:00:67:28:80".to_string()
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn run(instance: &str, command: &str, expect: i32) -> Self {
        Step::Run {
            instance: instance.to_string(),
            command: command.to_string(),
            expect,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Step::StageConfig { instance, config } => {
                format!("stage config.json for {} (image {})", instance, config.vm_data.image)
            }
            Step::StageCloudInit { instance, address, .. } => {
                format!("stage cloud-init for {} ({})", instance, address)
            }
            Step::StageFile { instance, file, .. } => format!("stage {} for {}", file, instance),
            Step::Run {
                instance,
                command,
                expect,
            } => format!("{} {} => {}", instance, command, expect),
            Step::WaitForBoot { instance } => format!("wait for {} to boot", instance),
            Step::SetImage { instance, image } => format!("set image of {} to {}", instance, image),
            Step::RemoveArchive { instance } => format!("remove archive of {}", instance),
            Step::AddImage { image } => format!("add {} to image pool", image),
            Step::GuestResponds { ip, status } => format!("guest {} answers {:?}", ip, status),
            Step::HangShutdown { instance, hang } => format!("{} ignores shutdown: {}", instance, hang),
            Step::ExpectArchive { instance, files, .. } => {
                format!("archive of {} holds {:?}", instance, files)
            }
            Step::ExpectNoArchive { instance } => format!("{} has no archive", instance),
            Step::ExpectLog {
                instance,
                contains,
                absent,
            } => format!(
                "log of {} {} '{}'",
                instance,
                if *absent { "lacks" } else { "contains" },
                contains
            ),
            Step::ExpectProbeCalls { ip, calls } => format!("{} probed {} time(s)", ip, calls),
        }
    }
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn from_yaml(content: &str) -> VmSentryResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> VmSentryResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub description: String,
    pub exit_code: Option<i32>,
    pub passed: bool,
    pub message: Option<String>,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub run_id: Uuid,
    pub scenario: String,
    pub steps: Vec<StepReport>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.passed)
    }

    pub fn violations(&self) -> Vec<&Violation> {
        self.steps.iter().flat_map(|s| s.violations.iter()).collect()
    }

    /// First failing step as an error
    pub fn into_result(self) -> VmSentryResult<Self> {
        match self.steps.iter().find(|s| !s.passed) {
            Some(step) => Err(VmSentryError::scenario(
                step.index,
                step.message
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string()),
            )),
            None => Ok(self),
        }
    }
}

/// Handles on the simulated backend, for steps that script the guest
#[derive(Clone)]
pub struct SimulationControls {
    pub hypervisor: Arc<SimulatedHypervisor>,
    pub probe: Arc<ScriptedProbe>,
    pub store: Arc<MemoryInstanceStore>,
}

pub struct ScenarioRunner {
    adaptor: Arc<ServiceAdaptor>,
    simulation: Option<SimulationControls>,
}

impl ScenarioRunner {
    pub fn new(adaptor: Arc<ServiceAdaptor>) -> Self {
        Self {
            adaptor,
            simulation: None,
        }
    }

    pub fn with_simulation(adaptor: Arc<ServiceAdaptor>, simulation: SimulationControls) -> Self {
        Self {
            adaptor,
            simulation: Some(simulation),
        }
    }

    /// Runner over a fresh simulated backend whose pool holds `images`
    pub fn simulated<I, S>(config: HarnessConfig, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let simulation = SimulationControls {
            hypervisor: Arc::new(SimulatedHypervisor::new()),
            probe: Arc::new(ScriptedProbe::new()),
            store: Arc::new(MemoryInstanceStore::with_images(images)),
        };
        let machine = LifecycleMachine::new(
            Arc::new(config),
            simulation.hypervisor.clone(),
            simulation.probe.clone(),
            simulation.store.clone(),
            Arc::new(SimulatedClock::default()),
        );
        let adaptor = Arc::new(ServiceAdaptor::new(machine, simulation.store.clone()));
        Self::with_simulation(adaptor, simulation)
    }

    pub fn simulation_controls(&self) -> Option<&SimulationControls> {
        self.simulation.as_ref()
    }

    pub fn adaptor(&self) -> &Arc<ServiceAdaptor> {
        &self.adaptor
    }

    /// Run every step, stopping at the first failure
    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        let run_id = Uuid::new_v4();
        info!(%run_id, scenario = %scenario.name, steps = scenario.steps.len(), "Running scenario");

        let mut last_outcomes: HashMap<String, CommandOutcome> = HashMap::new();
        let mut reports = Vec::new();
        for (index, step) in scenario.steps.iter().enumerate() {
            let report = match self.run_step(step, &mut last_outcomes).await {
                Ok((exit_code, violations)) => StepReport {
                    index,
                    description: step.describe(),
                    exit_code,
                    passed: violations.is_empty(),
                    message: violations.first().map(ToString::to_string),
                    violations,
                },
                Err(e) => StepReport {
                    index,
                    description: step.describe(),
                    exit_code: None,
                    passed: false,
                    message: Some(e.to_string()),
                    violations: Vec::new(),
                },
            };

            let passed = report.passed;
            if !passed {
                warn!(%run_id, step = index, message = ?report.message, "Scenario step failed");
            }
            reports.push(report);
            if !passed {
                break;
            }
        }

        ScenarioReport {
            run_id,
            scenario: scenario.name.clone(),
            steps: reports,
        }
    }

    /// Run several scenarios concurrently against the same adaptor
    pub async fn run_all(&self, scenarios: &[Scenario]) -> Vec<ScenarioReport> {
        join_all(scenarios.iter().map(|s| self.run(s))).await
    }

    async fn run_step(
        &self,
        step: &Step,
        last_outcomes: &mut HashMap<String, CommandOutcome>,
    ) -> VmSentryResult<(Option<i32>, Vec<Violation>)> {
        match step {
            Step::StageConfig { instance, config } => {
                self.adaptor.stage_config(instance, config).await?;
            }
            Step::StageCloudInit {
                instance,
                address,
                netmask,
                mac_address,
            } => {
                let iface = StaticInterface::parse(address, netmask, mac_address)?;
                self.adaptor
                    .stage_file(instance, META_DATA_FILE, &meta_data_lines(instance, &iface))
                    .await?;
                self.adaptor
                    .stage_file(instance, NETWORK_CONFIG_FILE, &network_config_lines(&iface))
                    .await?;
            }
            Step::StageFile {
                instance,
                file,
                lines,
            } => {
                self.adaptor.stage_file(instance, file, lines).await?;
            }
            Step::Run {
                instance,
                command,
                expect,
            } => {
                let command: LifecycleCommand = command.parse()?;
                let before = self.adaptor.directory(instance).await?;
                let outcome = self.adaptor.run(instance, &command).await?;
                let after = self.adaptor.directory(instance).await?;

                let mut violations = InvariantOracle::check(&before, &after, &outcome);
                let exit_code = outcome.exit_code();
                if exit_code != *expect {
                    violations.insert(
                        0,
                        Violation {
                            invariant: "exit-code".to_string(),
                            detail: format!("expected {}, got {}", expect, exit_code),
                        },
                    );
                }
                last_outcomes.insert(instance.clone(), outcome);
                return Ok((Some(exit_code), violations));
            }
            Step::WaitForBoot { instance } => self.wait_for_boot(instance).await?,
            Step::SetImage { instance, image } => {
                let dir = self.adaptor.directory(instance).await?;
                let mut config = dir.config(instance)?;
                config.vm_data.image = image.clone();
                self.adaptor.stage_config(instance, &config).await?;
            }
            Step::RemoveArchive { instance } => self.adaptor.remove_archive(instance).await?,
            Step::AddImage { image } => {
                self.simulation("add_image")?.store.add_image(image).await;
            }
            Step::GuestResponds { ip, status } => {
                self.simulation("guest_responds")?
                    .probe
                    .respond(ip, status.map(ProbeResult::new));
            }
            Step::HangShutdown { instance, hang } => {
                self.simulation("hang_shutdown")?
                    .hypervisor
                    .hang_shutdown(instance, *hang);
            }
            Step::ExpectArchive {
                instance,
                files,
                exact,
            } => {
                let dir = self.adaptor.directory(instance).await?;
                let listing = dir.archive_listing().unwrap_or_default();
                return Ok((None, expect_archive(&listing, files, *exact)));
            }
            Step::ExpectNoArchive { instance } => {
                let dir = self.adaptor.directory(instance).await?;
                if let Some(listing) = dir.archive_listing() {
                    return Ok((
                        None,
                        vec![Violation {
                            invariant: "archive-absent".to_string(),
                            detail: format!("found {:?}", listing),
                        }],
                    ));
                }
            }
            Step::ExpectLog {
                instance,
                contains,
                absent,
            } => {
                let found = last_outcomes
                    .get(instance)
                    .map_or(false, |o| o.log_contains(contains));
                if found == *absent {
                    return Ok((
                        None,
                        vec![Violation {
                            invariant: "log".to_string(),
                            detail: format!(
                                "'{}' {} in the last log of {}",
                                contains,
                                if *absent { "present" } else { "missing" },
                                instance
                            ),
                        }],
                    ));
                }
            }
            Step::ExpectProbeCalls { ip, calls } => {
                let actual = self.simulation("expect_probe_calls")?.probe.calls(ip);
                if actual != *calls {
                    return Ok((
                        None,
                        vec![Violation {
                            invariant: "probe-calls".to_string(),
                            detail: format!("expected {} probe(s) of {}, got {}", calls, ip, actual),
                        }],
                    ));
                }
            }
        }
        Ok((None, Vec::new()))
    }

    async fn wait_for_boot(&self, instance: &str) -> VmSentryResult<()> {
        let machine = self.adaptor.machine();
        let lifecycle = &machine.harness_config().lifecycle;
        let clock = machine.clock();
        let start = clock.now();
        loop {
            if machine
                .hypervisor()
                .console_shows(instance, &lifecycle.console_prompt)
                .await?
            {
                return Ok(());
            }
            let elapsed = clock.now().duration_since(start);
            if elapsed >= lifecycle.boot_wait {
                return Err(VmSentryError::Timeout {
                    operation: format!("wait for '{}' on {}", lifecycle.console_prompt, instance),
                    duration: elapsed,
                });
            }
            clock.sleep(lifecycle.poll_interval.max(Duration::from_millis(1))).await;
        }
    }

    fn simulation(&self, step: &str) -> VmSentryResult<&SimulationControls> {
        self.simulation
            .as_ref()
            .ok_or_else(|| VmSentryError::InvalidOperation {
                operation: step.to_string(),
                reason: "only available with the simulated backend".to_string(),
            })
    }
}

fn expect_archive(listing: &[String], files: &[String], exact: bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    for file in files {
        let prefix = format!("{}-", file);
        let matches = listing
            .iter()
            .filter(|entry| {
                entry
                    .strip_prefix(&prefix)
                    .map_or(false, |stamp| stamp.len() == 14 && stamp.chars().all(|c| c.is_ascii_digit()))
            })
            .count();
        if matches != 1 {
            violations.push(Violation {
                invariant: "archive-contents".to_string(),
                detail: format!("expected one {}-<timestamp>, found {} in {:?}", file, matches, listing),
            });
        }
    }
    if exact && listing.len() != files.len() {
        violations.push(Violation {
            invariant: "archive-contents".to_string(),
            detail: format!("expected exactly {:?}, found {:?}", files, listing),
        });
    }
    violations
}
