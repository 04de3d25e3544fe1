//! libvirt hypervisor driven through `virsh` on a node

use crate::node::{shell_quote, Node};
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vmsentry_core::error::{VmSentryError, VmSentryResult};
use vmsentry_core::hypervisor::{DomainSpec, DomainState, Hypervisor};

pub const DEFAULT_VIRSH: &str = "/usr/bin/virsh";

/// How long one console read may take before it is cut off
const CONSOLE_READ_SECS: u64 = 5;

pub struct VirshHypervisor {
    node: Arc<dyn Node>,
    virsh: String,
    xml_dir: PathBuf,
    console_read: Duration,
}

impl VirshHypervisor {
    pub fn new(node: Arc<dyn Node>) -> Self {
        Self {
            node,
            virsh: DEFAULT_VIRSH.to_string(),
            xml_dir: PathBuf::from("/tmp"),
            console_read: Duration::from_secs(CONSOLE_READ_SECS),
        }
    }

    pub fn with_virsh(mut self, virsh: impl Into<String>) -> Self {
        self.virsh = virsh.into();
        self
    }

    /// Where domain XML is written before `virsh define`
    pub fn with_xml_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.xml_dir = dir.into();
        self
    }

    fn command(&self, subcommand: &str, arg: &str) -> String {
        format!("{} {} {}", self.virsh, subcommand, shell_quote(arg))
    }

    async fn virsh(&self, subcommand: &str, name: &str) -> VmSentryResult<()> {
        let command = self.command(subcommand, name);
        let result = self.node.run(&command, true).await?;
        if !result.success() {
            return Err(VmSentryError::vm_operation(
                format!("virsh {}", subcommand),
                format!("{} on {}: {}", name, self.node.name(), result.stderr_text()),
            ));
        }
        info!(domain = name, node = self.node.name(), "virsh {} succeeded", subcommand);
        Ok(())
    }
}

/// Map `virsh domstate` output onto the states the lifecycle cares about
pub fn parse_domstate(output: &str) -> DomainState {
    match output.trim() {
        "running" | "idle" | "paused" | "blocked" => DomainState::Running,
        "in shutdown" => DomainState::InShutdown,
        "shut off" | "crashed" | "pmsuspended" => DomainState::ShutOff,
        other => {
            warn!("Unknown domain state '{}', treating as shut off", other);
            DomainState::ShutOff
        }
    }
}

fn is_missing_domain(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("failed to get domain") || stderr.contains("domain not found")
}

/// `"256M"` -> 256, `"2G"` -> 2048; a bare number is MiB
pub fn ram_mib(ram: &str) -> VmSentryResult<u64> {
    let ram = ram.trim();
    let (digits, factor) = match ram.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        None => (ram, 1),
        Some((i, _)) => match ram[i..].to_ascii_uppercase().as_str() {
            "M" | "MB" | "MIB" => (&ram[..i], 1),
            "G" | "GB" | "GIB" => (&ram[..i], 1024),
            _ => return Err(VmSentryError::validation("vm_data.ram", format!("unsupported size '{}'", ram))),
        },
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| VmSentryError::validation("vm_data.ram", format!("unsupported size '{}'", ram)))?;
    Ok(value * factor)
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

/// Minimal domain XML: one qcow2 disk, one bridged virtio NIC per interface and a serial console
pub fn domain_xml(spec: &DomainSpec) -> VmSentryResult<Vec<String>> {
    let vcpu: u32 = spec
        .cpu
        .trim()
        .parse()
        .map_err(|_| VmSentryError::validation("vm_data.cpu", format!("not a CPU count: '{}'", spec.cpu)))?;

    let mut xml = vec![
        "<domain type='kvm'>".to_string(),
        format!("  <name>{}</name>", xml_escape(&spec.name)),
        format!("  <memory unit='MiB'>{}</memory>", ram_mib(&spec.ram)?),
        format!("  <vcpu>{}</vcpu>", vcpu),
        "  <os>".to_string(),
        "    <type arch='x86_64'>hvm</type>".to_string(),
        "    <boot dev='hd'/>".to_string(),
        "  </os>".to_string(),
        "  <devices>".to_string(),
        "    <disk type='file' device='disk'>".to_string(),
        "      <driver name='qemu' type='qcow2'/>".to_string(),
        format!("      <source file='{}'/>", xml_escape(&spec.disk.to_string_lossy())),
        "      <target dev='vda' bus='virtio'/>".to_string(),
        "    </disk>".to_string(),
    ];
    for iface in spec.interfaces.values() {
        xml.push("    <interface type='bridge'>".to_string());
        xml.push(format!("      <source bridge='{}'/>", xml_escape(&iface.host_device)));
        if let Some(mac) = &iface.mac_address {
            xml.push(format!("      <mac address='{}'/>", xml_escape(mac)));
        }
        xml.push("      <model type='virtio'/>".to_string());
        xml.push("    </interface>".to_string());
    }
    xml.extend(
        [
            "    <serial type='pty'/>",
            "    <console type='pty'/>",
            "  </devices>",
            "</domain>",
        ]
        .map(str::to_string),
    );
    Ok(xml)
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn domain_state(&self, name: &str) -> VmSentryResult<Option<DomainState>> {
        let command = self.command("domstate", name);
        let result = self.node.run(&command, true).await?;
        if !result.success() {
            if is_missing_domain(&result.stderr_text()) {
                return Ok(None);
            }
            return Err(VmSentryError::vm_operation(
                "virsh domstate",
                format!("{} on {}: {}", name, self.node.name(), result.stderr_text()),
            ));
        }

        let state = result
            .stdout
            .iter()
            .find(|line| !line.trim().is_empty())
            .map(|line| parse_domstate(line))
            .unwrap_or(DomainState::ShutOff);
        debug!(domain = name, %state, "Domain state");
        Ok(Some(state))
    }

    async fn define(&self, spec: &DomainSpec) -> VmSentryResult<()> {
        let xml = domain_xml(spec)?;
        let path = self.xml_dir.join(format!("vmsentry-{}.xml", spec.name));
        self.node.create_file(&path, &xml, Some(0o600)).await?;

        let defined = self.virsh("define", &path.to_string_lossy()).await;
        self.node.remove_item(&path).await?;
        defined
    }

    async fn boot(&self, name: &str) -> VmSentryResult<()> {
        self.virsh("start", name).await
    }

    async fn request_shutdown(&self, name: &str) -> VmSentryResult<()> {
        self.virsh("shutdown", name).await
    }

    async fn destroy(&self, name: &str) -> VmSentryResult<()> {
        let command = self.command("destroy", name);
        let result = self.node.run(&command, true).await?;
        if result.success() || result.stderr_text().contains("domain is not running") {
            info!(domain = name, node = self.node.name(), "Domain destroyed");
            return Ok(());
        }
        Err(VmSentryError::vm_operation(
            "virsh destroy",
            format!("{} on {}: {}", name, self.node.name(), result.stderr_text()),
        ))
    }

    async fn undefine(&self, name: &str) -> VmSentryResult<()> {
        self.virsh("undefine", name).await
    }

    async fn console_shows(&self, name: &str, prompt: &str) -> VmSentryResult<bool> {
        let pattern = Regex::new(&regex::escape(prompt.trim()))
            .map_err(|e| VmSentryError::validation("console_prompt", e.to_string()))?;
        // A newline on stdin makes getty print its prompt again
        let command = format!(
            "printf '\\n' | timeout {} {} console --force {}",
            self.console_read.as_secs(),
            self.virsh,
            shell_quote(name)
        );
        let result = self.node.run(&command, true).await?;
        Ok(result.stdout.iter().any(|line| pattern.is_match(line)))
    }

    fn backend_type(&self) -> &'static str {
        "virsh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_node::MockNode;
    use std::collections::BTreeMap;
    use std::path::Path;
    use test_case::test_case;
    use tracing_test::traced_test;
    use vmsentry_core::instance_config::InterfaceConfig;

    fn spec() -> DomainSpec {
        let mut interfaces = BTreeMap::new();
        interfaces.insert(
            "eth0".to_string(),
            InterfaceConfig {
                host_device: "br0".to_string(),
                ipaddress: Some("10.46.80.14".to_string()),
                mac_address: Some("52:54:00:67:28:80".to_string()),
            },
        );
        DomainSpec {
            name: "vm1".to_string(),
            cpu: "2".to_string(),
            ram: "256M".to_string(),
            disk: PathBuf::from("/var/lib/libvirt/instances/vm1/rhel.img"),
            interfaces,
        }
    }

    #[test_case("running" => DomainState::Running)]
    #[test_case("paused" => DomainState::Running)]
    #[test_case("in shutdown" => DomainState::InShutdown)]
    #[test_case("shut off" => DomainState::ShutOff)]
    #[test_case("crashed" => DomainState::ShutOff)]
    #[test_case("  running  " => DomainState::Running)]
    #[test_case("no idea" => DomainState::ShutOff)]
    fn test_parse_domstate(output: &str) -> DomainState {
        parse_domstate(output)
    }

    #[test]
    #[traced_test]
    fn test_unknown_domstate_is_logged() {
        assert_eq!(parse_domstate("dying"), DomainState::ShutOff);
        assert!(logs_contain("Unknown domain state 'dying'"));
    }

    #[test_case("256M" => 256)]
    #[test_case("1024MB" => 1024)]
    #[test_case("2G" => 2048)]
    #[test_case("512" => 512)]
    fn test_ram_mib(ram: &str) -> u64 {
        ram_mib(ram).unwrap()
    }

    #[test]
    fn test_ram_mib_rejects_garbage() {
        assert!(ram_mib("lots").is_err());
        assert!(ram_mib("2T").is_err());
    }

    #[test]
    fn test_domain_xml() {
        let xml = domain_xml(&spec()).unwrap().join("\n");
        assert!(xml.contains("<name>vm1</name>"));
        assert!(xml.contains("<memory unit='MiB'>256</memory>"));
        assert!(xml.contains("<vcpu>2</vcpu>"));
        assert!(xml.contains("<source file='/var/lib/libvirt/instances/vm1/rhel.img'/>"));
        assert!(xml.contains("<source bridge='br0'/>"));
        assert!(xml.contains("<mac address='52:54:00:67:28:80'/>"));
    }

    #[tokio::test]
    async fn test_missing_domain_is_undefined() {
        let node = Arc::new(MockNode::new());
        node.on_failure("/usr/bin/virsh domstate", 1, "error: failed to get domain 'vm1'");
        let virsh = VirshHypervisor::new(node.clone());

        assert_eq!(virsh.domain_state("vm1").await.unwrap(), None);
        assert_eq!(node.commands(), vec!["/usr/bin/virsh domstate vm1"]);
    }

    #[tokio::test]
    async fn test_domstate_failure_is_an_error() {
        let node = Arc::new(MockNode::new());
        node.on_failure("/usr/bin/virsh domstate", 1, "error: failed to connect to the hypervisor");
        let virsh = VirshHypervisor::new(node);

        assert!(virsh.domain_state("vm1").await.is_err());
    }

    #[tokio::test]
    async fn test_domstate_maps_output() {
        let node = Arc::new(MockNode::new());
        node.on_stdout("/usr/bin/virsh domstate", &["in shutdown", ""]);
        let virsh = VirshHypervisor::new(node);

        assert_eq!(
            virsh.domain_state("vm1").await.unwrap(),
            Some(DomainState::InShutdown)
        );
    }

    #[tokio::test]
    async fn test_define_writes_and_removes_xml() {
        let node = Arc::new(MockNode::new());
        let virsh = VirshHypervisor::new(node.clone()).with_xml_dir("/tmp/xml");

        virsh.define(&spec()).await.unwrap();

        assert_eq!(node.commands(), vec!["/usr/bin/virsh define /tmp/xml/vmsentry-vm1.xml"]);
        assert_eq!(node.file(Path::new("/tmp/xml/vmsentry-vm1.xml")), None);
    }

    #[tokio::test]
    async fn test_failed_define_still_removes_xml() {
        let node = Arc::new(MockNode::new());
        node.on_failure("/usr/bin/virsh define", 1, "error: XML error");
        let virsh = VirshHypervisor::new(node.clone()).with_xml_dir("/tmp/xml");

        let err = virsh.define(&spec()).await.unwrap_err();
        assert!(err.to_string().contains("XML error"));
        assert_eq!(node.file(Path::new("/tmp/xml/vmsentry-vm1.xml")), None);
    }

    #[tokio::test]
    async fn test_destroy_of_stopped_domain_succeeds() {
        let node = Arc::new(MockNode::new());
        node.on_failure("/usr/bin/virsh destroy", 1, "error: Requested operation is not valid: domain is not running");
        let virsh = VirshHypervisor::new(node.clone());

        virsh.destroy("vm1").await.unwrap();
        assert_eq!(node.commands(), vec!["/usr/bin/virsh destroy vm1"]);
    }

    #[tokio::test]
    async fn test_console_prompt_detection() {
        let node = Arc::new(MockNode::new());
        node.on_stdout(
            "printf",
            &[
                "Connected to domain vm1",
                "Escape character is ^]",
                "",
                "vm-service-host.localdomain login: ",
            ],
        );
        let virsh = VirshHypervisor::new(node.clone());

        assert!(virsh
            .console_shows("vm1", "vm-service-host.localdomain login:")
            .await
            .unwrap());
        assert!(!virsh.console_shows("vm1", "other.localdomain login:").await.unwrap());
        assert!(node.commands()[0].contains("/usr/bin/virsh console --force vm1"));
    }
}
