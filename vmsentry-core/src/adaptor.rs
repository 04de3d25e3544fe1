//! Service adaptor: the entry point lifecycle commands go through
//!
//! Commands on one instance are serialized by a per-name lock; different
//! instances proceed in parallel. Each command loads the instance directory
//! from the store, runs the lifecycle machine and applies the resulting
//! journal before the lock is released.

use crate::config::defaults::*;
use crate::error::VmSentryResult;
use crate::instance_config::{join_lines, InstanceConfig};
use crate::instance_dir::{DirectoryJournal, InstanceDirectory};
use crate::lifecycle::{CommandOutcome, LifecycleCommand, LifecycleMachine, VmInstance};
use crate::store::InstanceStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct ServiceAdaptor {
    machine: LifecycleMachine,
    store: Arc<dyn InstanceStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    instances: DashMap<String, VmInstance>,
}

impl ServiceAdaptor {
    pub fn new(machine: LifecycleMachine, store: Arc<dyn InstanceStore>) -> Self {
        Self {
            machine,
            store,
            locks: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    pub fn machine(&self) -> &LifecycleMachine {
        &self.machine
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one lifecycle command against `name`
    pub async fn run(&self, name: &str, command: &LifecycleCommand) -> VmSentryResult<CommandOutcome> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let mut instance = self
            .instances
            .get(name)
            .map(|i| i.clone())
            .unwrap_or_else(|| VmInstance::new(name));
        instance.directory = self.store.load(name).await?;

        info!(instance = name, command = %command, "Running lifecycle command");
        let (instance, journal, outcome) = self.machine.execute(instance, command).await?;
        self.store.apply(name, &journal).await?;
        debug!(
            instance = name,
            exit_code = outcome.exit_code(),
            ops = journal.ops().len(),
            "Lifecycle command finished"
        );

        self.instances.insert(name.to_string(), instance);
        Ok(outcome)
    }

    /// Write a file into the instance directory, creating the directory first
    pub async fn stage_file(&self, name: &str, file: &str, lines: &[String]) -> VmSentryResult<()> {
        self.edit(name, |dir, journal| {
            dir.write_file(file, join_lines(lines), journal);
            Ok(())
        })
        .await
    }

    /// Stage `config.json`
    pub async fn stage_config(&self, name: &str, config: &InstanceConfig) -> VmSentryResult<()> {
        config.validate()?;
        self.stage_file(name, CONFIG_FILE, &config.to_lines()?).await
    }

    /// Delete `last_undefined_vm/`
    pub async fn remove_archive(&self, name: &str) -> VmSentryResult<()> {
        self.edit(name, |dir, journal| {
            dir.remove_archive(journal);
            Ok(())
        })
        .await
    }

    /// Current directory contents, read under the instance lock
    pub async fn directory(&self, name: &str) -> VmSentryResult<InstanceDirectory> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;
        self.store.load(name).await
    }

    /// Last known instance record, if any command has run against `name`
    pub fn instance(&self, name: &str) -> Option<VmInstance> {
        self.instances.get(name).map(|i| i.clone())
    }

    async fn edit<F>(&self, name: &str, f: F) -> VmSentryResult<()>
    where
        F: FnOnce(&mut InstanceDirectory, &mut DirectoryJournal) -> VmSentryResult<()>,
    {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        self.store.ensure_instance_dir(name).await?;
        let mut dir = self.store.load(name).await?;
        let mut journal = DirectoryJournal::new();
        f(&mut dir, &mut journal)?;
        self.store.apply(name, &journal).await
    }
}
