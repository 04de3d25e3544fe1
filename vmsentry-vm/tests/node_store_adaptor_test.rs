//! Lifecycle commands writing a real instance directory through a local node

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;
use vmsentry_core::abstractions::time::SimulatedClock;
use vmsentry_core::config::defaults::*;
use vmsentry_core::error::{VmSentryError, VmSentryResult};
use vmsentry_core::hypervisor::{DomainSpec, DomainState, Hypervisor};
use vmsentry_core::instance_config::{InstanceConfig, InterfaceConfig, StatusCheckPolicy};
use vmsentry_core::lifecycle::{LifecycleCommand, LifecycleMachine};
use vmsentry_core::simulation::{ScriptedProbe, SimulatedHypervisor};
use vmsentry_core::status_check::ProbeResult;
use vmsentry_core::store::InstanceStore;
use vmsentry_core::{HarnessConfig, ServiceAdaptor};
use vmsentry_vm::node::LocalNode;
use vmsentry_vm::node_store::NodeInstanceStore;

const IP: &str = "10.46.80.14";

/// Refuses to define or boot a domain whose disk is not on the filesystem
struct DiskCheckingHypervisor {
    inner: Arc<SimulatedHypervisor>,
}

impl DiskCheckingHypervisor {
    fn check_disk(operation: &str, spec: &DomainSpec) -> VmSentryResult<()> {
        if spec.disk.is_file() {
            Ok(())
        } else {
            Err(VmSentryError::vm_operation(
                operation,
                format!("disk {} does not exist", spec.disk.display()),
            ))
        }
    }
}

#[async_trait]
impl Hypervisor for DiskCheckingHypervisor {
    async fn domain_state(&self, name: &str) -> VmSentryResult<Option<DomainState>> {
        self.inner.domain_state(name).await
    }

    async fn define(&self, spec: &DomainSpec) -> VmSentryResult<()> {
        Self::check_disk("define", spec)?;
        self.inner.define(spec).await
    }

    async fn boot(&self, name: &str) -> VmSentryResult<()> {
        if let Some(spec) = self.inner.spec(name) {
            Self::check_disk("boot", &spec)?;
        }
        self.inner.boot(name).await
    }

    async fn request_shutdown(&self, name: &str) -> VmSentryResult<()> {
        self.inner.request_shutdown(name).await
    }

    async fn destroy(&self, name: &str) -> VmSentryResult<()> {
        self.inner.destroy(name).await
    }

    async fn undefine(&self, name: &str) -> VmSentryResult<()> {
        self.inner.undefine(name).await
    }

    async fn console_shows(&self, name: &str, prompt: &str) -> VmSentryResult<bool> {
        self.inner.console_shows(name, prompt).await
    }

    fn backend_type(&self) -> &'static str {
        "disk-checking"
    }
}

struct Harness {
    _tmp: TempDir,
    config: HarnessConfig,
    hypervisor: Arc<SimulatedHypervisor>,
    probe: Arc<ScriptedProbe>,
    adaptor: ServiceAdaptor,
}

fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = HarnessConfig::test(tmp.path());
    std::fs::create_dir_all(&config.images_root).unwrap();
    std::fs::write(config.images_root.join("rhel.img"), b"QFI\xfb").unwrap();
    std::fs::write(config.images_root.join("rhel7_4.img"), b"QFI\xfb").unwrap();

    let hypervisor = Arc::new(SimulatedHypervisor::new());
    let probe = Arc::new(ScriptedProbe::new());
    let store = Arc::new(NodeInstanceStore::from_config(Arc::new(LocalNode::new()), &config));
    let machine = LifecycleMachine::new(
        Arc::new(config.clone()),
        Arc::new(DiskCheckingHypervisor {
            inner: hypervisor.clone(),
        }),
        probe.clone(),
        store.clone(),
        Arc::new(SimulatedClock::default()),
    );
    Harness {
        _tmp: tmp,
        config,
        hypervisor,
        probe,
        adaptor: ServiceAdaptor::new(machine, store),
    }
}

fn instance_config(image: &str) -> InstanceConfig {
    InstanceConfig::new(image)
        .with_interface(
            "eth0",
            InterfaceConfig {
                host_device: "br0".to_string(),
                ipaddress: Some(IP.to_string()),
                mac_address: None,
            },
        )
        .with_status_check(StatusCheckPolicy::on(IP))
        .with_timeouts(60, 10, 5)
}

fn listing(h: &Harness, sub: &str) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(h.config.instance_dir("vm1").join(sub))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_start_writes_live_files_and_image() {
    let h = harness();
    h.probe.respond(IP, Some(ProbeResult::OK));
    h.adaptor.stage_config("vm1", &instance_config("rhel.img")).await.unwrap();

    let outcome = h.adaptor.run("vm1", &LifecycleCommand::Start).await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        listing(&h, ""),
        vec!["config.json", "config.json.live", "rhel.img"]
    );

    let staged = std::fs::read_to_string(h.config.instance_dir("vm1").join(CONFIG_FILE)).unwrap();
    let live = std::fs::read_to_string(h.config.instance_dir("vm1").join("config.json.live")).unwrap();
    assert_eq!(staged, live);
    assert_eq!(h.hypervisor.count("define", "vm1"), 1);
}

#[tokio::test]
async fn test_stop_undefine_archives_on_disk() {
    let h = harness();
    h.probe.respond(IP, Some(ProbeResult::OK));
    h.adaptor.stage_config("vm1", &instance_config("rhel.img")).await.unwrap();
    h.adaptor
        .stage_file("vm1", USER_DATA_FILE, &["#cloud-config".to_string()])
        .await
        .unwrap();

    h.adaptor.run("vm1", &LifecycleCommand::Start).await.unwrap();
    let outcome = h
        .adaptor
        .run("vm1", &LifecycleCommand::StopUndefine { stop_timeout: None })
        .await
        .unwrap();
    assert_eq!(outcome.exit_code(), 0);

    assert_eq!(listing(&h, ""), vec!["config.json", ARCHIVE_DIR, "user-data"]);
    let archived = listing(&h, ARCHIVE_DIR);
    let originals: Vec<&str> = archived
        .iter()
        .map(|n| n.rsplit_once('-').map(|(orig, _)| orig).unwrap_or(n))
        .collect();
    assert_eq!(originals, vec!["config.json.live", "rhel.img", "user-data.live"]);

    // What the store reads back agrees with what the adaptor saw
    let dir = h.adaptor.directory("vm1").await.unwrap();
    assert_eq!(dir.archive_listing().unwrap(), archived);
}

#[tokio::test]
async fn test_restart_after_undefine_replaces_archive() {
    let h = harness();
    for image in ["rhel.img", "rhel7_4.img"] {
        h.adaptor
            .stage_config("vm1", &InstanceConfig::new(image))
            .await
            .unwrap();
        assert_eq!(h.adaptor.run("vm1", &LifecycleCommand::Start).await.unwrap().exit_code(), 0);
        assert_eq!(
            h.adaptor
                .run("vm1", &LifecycleCommand::ForceStopUndefine)
                .await
                .unwrap()
                .exit_code(),
            0
        );
    }

    let archived = listing(&h, ARCHIVE_DIR);
    assert_eq!(archived.len(), 2);
    assert!(archived.iter().any(|n| n.starts_with("rhel7_4.img-")));
    assert!(!archived.iter().any(|n| n.starts_with("rhel.img-")));
    assert_eq!(h.hypervisor.count("undefine", "vm1"), 2);
}

#[tokio::test]
async fn test_missing_pool_image_fails_start_without_defining() {
    let h = harness();
    h.adaptor
        .stage_config("vm1", &InstanceConfig::new("absent.img"))
        .await
        .unwrap();

    assert!(h.adaptor.run("vm1", &LifecycleCommand::Start).await.is_err());
    assert_eq!(h.hypervisor.count("define", "vm1"), 0);
    assert_eq!(listing(&h, ""), vec!["config.json"]);

    let store = NodeInstanceStore::from_config(Arc::new(LocalNode::new()), &h.config);
    assert!(!store.load("vm1").await.unwrap().has_archive());
}

#[tokio::test]
async fn test_disk_exists_when_domain_boots() {
    let h = harness();
    h.adaptor.stage_config("vm1", &InstanceConfig::new("rhel.img")).await.unwrap();

    let outcome = h.adaptor.run("vm1", &LifecycleCommand::Start).await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(h.hypervisor.count("boot", "vm1"), 1);

    let spec = h.hypervisor.spec("vm1").unwrap();
    assert_eq!(spec.disk, h.config.instance_dir("vm1").join("rhel.img"));
    assert_eq!(std::fs::read(&spec.disk).unwrap(), b"QFI\xfb");
}

#[tokio::test]
async fn test_failed_boot_keeps_files_for_archive() {
    let h = harness();
    h.adaptor.stage_config("vm1", &InstanceConfig::new("rhel.img")).await.unwrap();
    h.hypervisor.fail_next("boot");

    assert!(h.adaptor.run("vm1", &LifecycleCommand::Start).await.is_err());
    assert_eq!(h.hypervisor.count("define", "vm1"), 1);
    assert_eq!(
        listing(&h, ""),
        vec!["config.json", "config.json.live", "rhel.img"]
    );

    // The domain stays defined; the next start only boots it
    assert_eq!(h.adaptor.run("vm1", &LifecycleCommand::Start).await.unwrap().exit_code(), 0);
    assert_eq!(h.hypervisor.count("define", "vm1"), 1);
    assert_eq!(h.hypervisor.count("boot", "vm1"), 1);

    let outcome = h
        .adaptor
        .run("vm1", &LifecycleCommand::ForceStopUndefine)
        .await
        .unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        outcome.archive.unwrap().originals(),
        vec!["config.json.live", "rhel.img"]
    );
    assert_eq!(listing(&h, ""), vec!["config.json", ARCHIVE_DIR]);
}

#[tokio::test]
async fn test_image_staged_in_instance_dir_only() {
    let h = harness();
    let dir = h.config.instance_dir("vm1");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("staged.qcow2"), b"QFI\xfb\x00\xff\xfe\x80").unwrap();
    h.adaptor
        .stage_config("vm1", &InstanceConfig::new("staged.qcow2"))
        .await
        .unwrap();

    assert_eq!(h.adaptor.run("vm1", &LifecycleCommand::Start).await.unwrap().exit_code(), 0);
    assert_eq!(h.adaptor.run("vm1", &LifecycleCommand::Status).await.unwrap().exit_code(), 0);
    assert_eq!(
        std::fs::read(dir.join("staged.qcow2")).unwrap(),
        b"QFI\xfb\x00\xff\xfe\x80"
    );

    let outcome = h
        .adaptor
        .run("vm1", &LifecycleCommand::ForceStopUndefine)
        .await
        .unwrap();
    assert_eq!(outcome.exit_code(), 0);
    let archived = listing(&h, ARCHIVE_DIR);
    assert!(archived.iter().any(|n| n.starts_with("staged.qcow2-")));

    // The archived copy is binary and absent from the pool; loading still works
    let store = NodeInstanceStore::from_config(Arc::new(LocalNode::new()), &h.config);
    assert_eq!(store.load("vm1").await.unwrap().archive_listing().unwrap(), archived);
    assert_eq!(h.adaptor.run("vm1", &LifecycleCommand::Status).await.unwrap().exit_code(), 3);
}
