//! VM service lifecycle state machine
//!
//! [`LifecycleMachine::execute`] takes an instance value, drives the
//! hypervisor and returns the new value together with the directory journal
//! the caller must apply. Files the hypervisor reads (the disk image and the
//! `.live` snapshots) are committed to the store before `define` and `boot`.
//! Lifecycle failures (a 503 from the guest, a start
//! that never becomes healthy) are ordinary [`CommandOutcome`]s; only
//! infrastructure problems are errors.

use crate::abstractions::time::Clock;
use crate::archive::{archive_on_undefine, ArchiveManifest, StampGenerator};
use crate::config::defaults::*;
use crate::config::HarnessConfig;
use crate::error::{VmSentryError, VmSentryResult};
use crate::hypervisor::{DomainSpec, DomainState, Hypervisor};
use crate::instance_config::InstanceConfig;
use crate::instance_dir::{DirectoryJournal, InstanceDirectory};
use crate::status_check::{GuestProbe, Outcome, StatusPoller};
use crate::store::InstanceStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Undefined,
    DefinedStopped,
    Running,
    /// Only seen while the hypervisor reports the domain "in shutdown"
    Stopping,
}

impl VmState {
    pub fn from_domain(state: Option<DomainState>) -> Self {
        match state {
            None => VmState::Undefined,
            Some(DomainState::ShutOff) => VmState::DefinedStopped,
            Some(DomainState::Running) => VmState::Running,
            Some(DomainState::InShutdown) => VmState::Stopping,
        }
    }

    pub fn is_defined(self) -> bool {
        self != VmState::Undefined
    }

    pub fn is_up(self) -> bool {
        matches!(self, VmState::Running | VmState::Stopping)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmInstance {
    pub name: String,
    pub state: VmState,
    pub config: Option<InstanceConfig>,
    pub directory: InstanceDirectory,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
    pub guest_health: Option<Outcome>,
}

impl VmInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: VmState::Undefined,
            config: None,
            directory: InstanceDirectory::new(),
            last_started_at: None,
            last_stopped_at: None,
            guest_health: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum LifecycleCommand {
    Start,
    Status,
    Stop,
    StopUndefine {
        #[serde(default, with = "humantime_serde")]
        stop_timeout: Option<Duration>,
    },
    ForceStopUndefine,
}

impl LifecycleCommand {
    /// Parse adaptor arguments, e.g. `["stop-undefine", "--stop-timeout=33"]`
    pub fn parse_args<S: AsRef<str>>(args: &[S]) -> VmSentryResult<Self> {
        let mut args = args.iter().map(AsRef::as_ref);
        let name = args.next().ok_or_else(|| invalid("", "missing subcommand"))?;
        let rest: Vec<&str> = args.collect();

        let command = match name {
            "start" => LifecycleCommand::Start,
            "status" => LifecycleCommand::Status,
            "stop" => LifecycleCommand::Stop,
            "force-stop-undefine" => LifecycleCommand::ForceStopUndefine,
            "stop-undefine" => {
                return Ok(LifecycleCommand::StopUndefine {
                    stop_timeout: parse_stop_timeout(&rest)?,
                })
            }
            other => return Err(invalid(other, "unknown subcommand")),
        };
        if let Some(extra) = rest.first() {
            return Err(invalid(name, &format!("unexpected argument '{}'", extra)));
        }
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleCommand::Start => "start",
            LifecycleCommand::Status => "status",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::StopUndefine { .. } => "stop-undefine",
            LifecycleCommand::ForceStopUndefine => "force-stop-undefine",
        }
    }
}

impl FromStr for LifecycleCommand {
    type Err = VmSentryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let args: Vec<&str> = s.split_whitespace().collect();
        Self::parse_args(&args)
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleCommand::StopUndefine {
                stop_timeout: Some(t),
            } => write!(f, "stop-undefine --stop-timeout={}", t.as_secs()),
            other => f.write_str(other.name()),
        }
    }
}

fn parse_stop_timeout(args: &[&str]) -> VmSentryResult<Option<Duration>> {
    let value = match args {
        [] => return Ok(None),
        [flag] => flag
            .strip_prefix("--stop-timeout=")
            .ok_or_else(|| invalid("stop-undefine", &format!("unexpected argument '{}'", flag)))?,
        ["--stop-timeout", value] => value,
        _ => {
            return Err(invalid(
                "stop-undefine",
                "expected --stop-timeout=N or --stop-timeout N",
            ))
        }
    };
    let secs: u64 = value.parse().map_err(|_| {
        invalid(
            "stop-undefine",
            &format!("--stop-timeout must be whole seconds, got '{}'", value),
        )
    })?;
    Ok(Some(Duration::from_secs(secs)))
}

fn invalid(operation: &str, reason: &str) -> VmSentryError {
    VmSentryError::InvalidOperation {
        operation: operation.to_string(),
        reason: reason.to_string(),
    }
}

/// Result class of a lifecycle command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    ExplicitFailure,
    NotRunning,
    Timeout,
}

impl CommandStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            CommandStatus::Success => 0,
            CommandStatus::ExplicitFailure => 1,
            CommandStatus::NotRunning => 3,
            CommandStatus::Timeout => -1,
        }
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CommandStatus::Success),
            1 => Some(CommandStatus::ExplicitFailure),
            3 => Some(CommandStatus::NotRunning),
            -1 | 255 => Some(CommandStatus::Timeout),
            _ => None,
        }
    }

    fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => CommandStatus::Success,
            Outcome::ExplicitFailure => CommandStatus::ExplicitFailure,
            Outcome::Timeout | Outcome::KeepPolling => CommandStatus::Timeout,
        }
    }
}

/// A timed phase inside a command and how it ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub outcome: Outcome,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: LifecycleCommand,
    pub status: CommandStatus,
    /// Nothing had to change
    pub noop: bool,
    pub phases: Vec<Phase>,
    pub archive: Option<ArchiveManifest>,
    pub log: Vec<String>,
}

impl CommandOutcome {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn log_contains(&self, needle: &str) -> bool {
        self.log.iter().any(|line| line.contains(needle))
    }
}

/// Collects adaptor log lines and mirrors them to tracing
struct CommandLog {
    name: String,
    lines: Vec<String>,
}

impl CommandLog {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lines: Vec::new(),
        }
    }

    fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(instance = %self.name, "{}", message);
        self.lines.push(message);
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(instance = %self.name, "{}", message);
        self.lines.push(message);
    }
}

enum ShutdownResult {
    Completed(Duration),
    TimedOut(Duration),
}

pub struct LifecycleMachine {
    config: Arc<HarnessConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    probe: Arc<dyn GuestProbe>,
    store: Arc<dyn InstanceStore>,
    clock: Arc<dyn Clock>,
    stamps: StampGenerator,
}

impl LifecycleMachine {
    pub fn new(
        config: Arc<HarnessConfig>,
        hypervisor: Arc<dyn Hypervisor>,
        probe: Arc<dyn GuestProbe>,
        store: Arc<dyn InstanceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            hypervisor,
            probe,
            store,
            clock,
            stamps: StampGenerator::new(),
        }
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn harness_config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run `command` against `instance`
    ///
    /// The returned journal holds the operations not yet applied to the
    /// store. On error, whatever was journaled is committed before the error
    /// is returned.
    pub async fn execute(
        &self,
        mut instance: VmInstance,
        command: &LifecycleCommand,
    ) -> VmSentryResult<(VmInstance, DirectoryJournal, CommandOutcome)> {
        instance.state = VmState::from_domain(self.hypervisor.domain_state(&instance.name).await?);
        instance.config = instance.directory.config(&instance.name).ok();

        let mut run = CommandRun {
            log: CommandLog::new(&instance.name),
            journal: DirectoryJournal::new(),
            phases: Vec::new(),
            archive: None,
            noop: false,
        };

        let result = match command {
            LifecycleCommand::Start => self.start(&mut instance, &mut run).await,
            LifecycleCommand::Status => self.status(&mut instance, &mut run).await,
            LifecycleCommand::Stop => self.stop(&mut instance, &mut run).await,
            LifecycleCommand::StopUndefine { stop_timeout } => {
                let timeout = stop_timeout.unwrap_or(self.config.lifecycle.default_stop_timeout);
                self.stop_undefine(&mut instance, timeout, &mut run).await
            }
            LifecycleCommand::ForceStopUndefine => self.force_stop_undefine(&mut instance, &mut run).await,
        };
        let status = match result {
            Ok(status) => status,
            Err(e) => {
                if let Err(commit_err) = self.commit(&instance.name, &mut run.journal).await {
                    warn!(instance = %instance.name, error = %commit_err, "Could not commit journal of failed command");
                }
                return Err(e);
            }
        };

        let outcome = CommandOutcome {
            command: command.clone(),
            status,
            noop: run.noop,
            phases: run.phases,
            archive: run.archive,
            log: run.log.lines,
        };
        Ok((instance, run.journal, outcome))
    }

    async fn start(&self, instance: &mut VmInstance, run: &mut CommandRun) -> VmSentryResult<CommandStatus> {
        let name = instance.name.clone();
        if instance.state == VmState::Running {
            run.log.info(format!("Service {} is already running", name));
            run.noop = true;
            return Ok(CommandStatus::Success);
        }

        let config = instance.directory.config(&name)?;
        run.log.info(format!("Starting Service {}", name));

        if instance.state == VmState::Stopping {
            self.wait_for_shutdown(&name, self.config.lifecycle.default_stop_timeout)
                .await?;
            instance.state = VmState::from_domain(self.hypervisor.domain_state(&name).await?);
        }

        if instance.state == VmState::Undefined {
            self.define(instance, &config, run).await?;
        } else if !instance.directory.contains(&config.vm_data.image) {
            // Defined earlier but the disk never landed
            self.stage_image(instance, &config, run).await?;
            self.commit(&name, &mut run.journal).await?;
        }

        self.hypervisor.boot(&name).await?;
        instance.state = VmState::Running;
        instance.last_started_at = Some(self.wall_clock());
        instance.config = Some(config.clone());

        let Some(ip) = config.adaptor_data.internal_status_check.target() else {
            instance.guest_health = None;
            run.log.info(format!("Service {} started", name));
            return Ok(CommandStatus::Success);
        };

        let window = config.adaptor_data.start_window();
        run.log.info(format!(
            "Waiting up to {}s for internal status check of {}",
            window.as_secs(),
            ip
        ));
        let report = StatusPoller::new(self.probe.as_ref(), self.clock.as_ref(), self.config.lifecycle.poll_interval)
            .poll(ip, window, None)
            .await;
        run.phases.push(Phase {
            name: "start-status-check".to_string(),
            outcome: report.outcome,
            elapsed: report.elapsed,
        });
        instance.guest_health = Some(report.outcome);

        let status = CommandStatus::from_outcome(report.outcome);
        match report.outcome {
            Outcome::Success => run.log.info(format!("Service {} started", name)),
            Outcome::ExplicitFailure => run.log.warn(format!(
                "Internal status check of {} reported the service unavailable",
                ip
            )),
            _ => run.log.warn(format!(
                "Internal status check of {} gave no verdict within {}s",
                ip,
                window.as_secs()
            )),
        }
        Ok(status)
    }

    async fn define(
        &self,
        instance: &mut VmInstance,
        config: &InstanceConfig,
        run: &mut CommandRun,
    ) -> VmSentryResult<()> {
        let name = instance.name.clone();
        self.stage_image(instance, config, run).await?;
        for file in [CONFIG_FILE, META_DATA_FILE, NETWORK_CONFIG_FILE, USER_DATA_FILE] {
            instance.directory.snapshot_live(file, &mut run.journal);
        }
        self.commit(&name, &mut run.journal).await?;

        let spec = DomainSpec::from_config(&name, config, self.config.instance_dir(&name));
        run.log.info(format!("Defining Service {}", name));
        self.hypervisor.define(&spec).await?;
        instance.state = VmState::DefinedStopped;
        Ok(())
    }

    /// Journal the pool copy of the configured image
    ///
    /// An image already sitting in the instance directory is used as is when
    /// the pool does not have it.
    async fn stage_image(
        &self,
        instance: &mut VmInstance,
        config: &InstanceConfig,
        run: &mut CommandRun,
    ) -> VmSentryResult<()> {
        let image = &config.vm_data.image;
        if self.store.contains_image(image).await? {
            run.log.info(format!("Copying image {} to instance directory", image));
            instance.directory.copy_image(image, &mut run.journal);
            Ok(())
        } else if instance.directory.contains(image) {
            Ok(())
        } else {
            Err(VmSentryError::ImageNotFound {
                image: image.clone(),
            })
        }
    }

    /// Apply the pending journal to the store and start a fresh one
    async fn commit(&self, name: &str, journal: &mut DirectoryJournal) -> VmSentryResult<()> {
        if journal.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(journal);
        self.store.apply(name, &pending).await
    }

    async fn status(&self, instance: &mut VmInstance, run: &mut CommandRun) -> VmSentryResult<CommandStatus> {
        let name = instance.name.clone();
        if instance.state != VmState::Running {
            run.log.info(format!("Service {} is not running", name));
            return Ok(CommandStatus::NotRunning);
        }

        let Some(config) = instance.config.clone() else {
            run.log.info(format!("Service {} is running", name));
            return Ok(CommandStatus::Success);
        };
        let Some(ip) = config.adaptor_data.internal_status_check.target() else {
            run.log.info(format!("Service {} is running", name));
            return Ok(CommandStatus::Success);
        };

        let report = StatusPoller::new(self.probe.as_ref(), self.clock.as_ref(), self.config.lifecycle.poll_interval)
            .poll(
                ip,
                config.adaptor_data.status_window(),
                Some(config.adaptor_data.status_retry),
            )
            .await;
        run.phases.push(Phase {
            name: "status-check".to_string(),
            outcome: report.outcome,
            elapsed: report.elapsed,
        });
        instance.guest_health = Some(report.outcome);
        run.log.info(format!(
            "Internal status check of {} after {} attempt(s): {:?}",
            ip, report.attempts, report.outcome
        ));
        Ok(CommandStatus::from_outcome(report.outcome))
    }

    async fn stop(&self, instance: &mut VmInstance, run: &mut CommandRun) -> VmSentryResult<CommandStatus> {
        let name = instance.name.clone();
        match instance.state {
            VmState::Undefined => {
                run.log.info(format!("Service {} is not defined", name));
                run.noop = true;
            }
            VmState::DefinedStopped => {
                run.log.info(format!("Service {} is already stopped", name));
                run.noop = true;
            }
            VmState::Running | VmState::Stopping => {
                let timeout = self.config.lifecycle.default_stop_timeout;
                run.log.info(format!("Stopping Service {}", name));
                if let ShutdownResult::TimedOut(elapsed) =
                    self.graceful_stop(instance, timeout, run).await?
                {
                    run.log.warn(format!(
                        "Service {} did not stop within {}s",
                        name,
                        elapsed.as_secs()
                    ));
                    self.destroy(&name, run).await?;
                }
                instance.state = VmState::DefinedStopped;
                instance.last_stopped_at = Some(self.wall_clock());
                instance.guest_health = None;
            }
        }
        Ok(CommandStatus::Success)
    }

    async fn stop_undefine(
        &self,
        instance: &mut VmInstance,
        timeout: Duration,
        run: &mut CommandRun,
    ) -> VmSentryResult<CommandStatus> {
        let name = instance.name.clone();
        if instance.state == VmState::Undefined {
            run.log.info(format!("Service {} is not defined", name));
            run.noop = true;
            return Ok(CommandStatus::Success);
        }

        if instance.state.is_up() {
            run.log.info(format!(
                "Stopping Service {} with a timeout of {}s",
                name,
                timeout.as_secs()
            ));
            if let ShutdownResult::TimedOut(elapsed) = self.graceful_stop(instance, timeout, run).await? {
                run.log.warn(format!(
                    "Service {} did not stop within {}s, calling force-stop-undefine",
                    name,
                    elapsed.as_secs()
                ));
                self.destroy(&name, run).await?;
            }
            instance.last_stopped_at = Some(self.wall_clock());
        }

        self.undefine_and_archive(instance, run).await?;
        Ok(CommandStatus::Success)
    }

    async fn force_stop_undefine(
        &self,
        instance: &mut VmInstance,
        run: &mut CommandRun,
    ) -> VmSentryResult<CommandStatus> {
        let name = instance.name.clone();
        if instance.state == VmState::Undefined {
            run.log.info(format!("Service {} is not defined", name));
            run.noop = true;
            return Ok(CommandStatus::Success);
        }

        if instance.state.is_up() {
            self.destroy(&name, run).await?;
            instance.last_stopped_at = Some(self.wall_clock());
        }
        self.undefine_and_archive(instance, run).await?;
        Ok(CommandStatus::Success)
    }

    async fn destroy(&self, name: &str, run: &mut CommandRun) -> VmSentryResult<()> {
        run.log.info(format!("Attempting to destroy Service {}", name));
        self.hypervisor.destroy(name).await
    }

    async fn undefine_and_archive(&self, instance: &mut VmInstance, run: &mut CommandRun) -> VmSentryResult<()> {
        let name = instance.name.clone();
        run.log.info(format!("Undefining Service {}", name));
        self.hypervisor.undefine(&name).await?;
        instance.state = VmState::Undefined;
        instance.guest_health = None;

        let image = instance.config.as_ref().map(|c| c.vm_data.image.clone());
        let stamp = self.stamps.next(self.clock.system_time());
        let (directory, journal, manifest) =
            archive_on_undefine(&instance.directory, image.as_deref(), &stamp);
        if let Some(manifest) = &manifest {
            run.log.info(format!(
                "Archived {} file(s) of Service {} to {}",
                manifest.entries.len(),
                name,
                ARCHIVE_DIR
            ));
        }
        instance.directory = directory;
        run.journal.extend(journal);
        run.archive = manifest;
        Ok(())
    }

    async fn graceful_stop(
        &self,
        instance: &VmInstance,
        timeout: Duration,
        run: &mut CommandRun,
    ) -> VmSentryResult<ShutdownResult> {
        if instance.state == VmState::Running {
            self.hypervisor.request_shutdown(&instance.name).await?;
        }
        let result = self.wait_for_shutdown(&instance.name, timeout).await?;
        let (outcome, elapsed) = match result {
            ShutdownResult::Completed(elapsed) => (Outcome::Success, elapsed),
            ShutdownResult::TimedOut(elapsed) => (Outcome::Timeout, elapsed),
        };
        run.phases.push(Phase {
            name: "graceful-stop".to_string(),
            outcome,
            elapsed,
        });
        Ok(result)
    }

    async fn wait_for_shutdown(&self, name: &str, timeout: Duration) -> VmSentryResult<ShutdownResult> {
        let start = self.clock.now();
        loop {
            let elapsed = self.clock.now().duration_since(start);
            match self.hypervisor.domain_state(name).await? {
                None | Some(DomainState::ShutOff) => return Ok(ShutdownResult::Completed(elapsed)),
                Some(_) if elapsed >= timeout => return Ok(ShutdownResult::TimedOut(elapsed)),
                Some(_) => self.clock.sleep(self.config.lifecycle.poll_interval).await,
            }
        }
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        self.clock.system_time().into()
    }
}

struct CommandRun {
    log: CommandLog,
    journal: DirectoryJournal,
    phases: Vec<Phase>,
    archive: Option<ArchiveManifest>,
    noop: bool,
}
