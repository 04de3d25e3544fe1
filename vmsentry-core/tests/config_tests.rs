use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;
use vmsentry_core::config::HarnessConfig;
use vmsentry_core::instance_config::InstanceConfig;

#[test]
fn test_default_config() {
    let config = HarnessConfig::default();

    assert_eq!(config.instances_root, PathBuf::from("/var/lib/libvirt/instances"));
    assert_eq!(config.images_root, PathBuf::from("/var/lib/libvirt/images"));
    assert_eq!(config.lifecycle.default_stop_timeout, Duration::from_secs(60));
    assert_eq!(config.probe.port, 9999);
    assert_eq!(config.probe.path, "/");
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_from_toml() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
instances_root = "/srv/instances"
adaptor_log = "/srv/adaptor.log"

[lifecycle]
default_stop_timeout = "45s"
poll_interval = "500ms"
console_prompt = "guest login:"

[probe]
port = 8080
path = "/health"
"#
    )
    .unwrap();

    let config = HarnessConfig::from_file(file.path()).unwrap();

    assert_eq!(config.instances_root, PathBuf::from("/srv/instances"));
    assert_eq!(config.images_root, PathBuf::from("/var/lib/libvirt/images"));
    assert_eq!(config.lifecycle.default_stop_timeout, Duration::from_secs(45));
    assert_eq!(config.lifecycle.poll_interval, Duration::from_millis(500));
    assert_eq!(config.lifecycle.console_prompt, "guest login:");
    assert_eq!(config.probe.port, 8080);
    assert_eq!(config.instance_dir("vm1"), PathBuf::from("/srv/instances/vm1"));
}

#[test]
fn test_invalid_toml_values_are_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "[probe]\npath = \"health\"\n").unwrap();
    assert!(HarnessConfig::from_file(file.path()).is_err());

    let mut file = NamedTempFile::new().unwrap();
    write!(file, "[lifecycle]\npoll_interval = \"0s\"\n").unwrap();
    assert!(HarnessConfig::from_file(file.path()).is_err());
}

#[test]
fn test_missing_config_file() {
    let err = HarnessConfig::from_file(std::path::Path::new("/nonexistent/vmsentry.toml")).unwrap_err();
    assert!(err.to_string().contains("/nonexistent/vmsentry.toml"));
}

#[test]
fn test_instance_config_from_adaptor_json() {
    let config = InstanceConfig::parse(
        r#"{
  "vm_data": {
    "cpu": "4",
    "ram": "1024M",
    "interfaces": {
      "eth0": {"host_device": "br0", "ipaddress": "10.46.80.14", "mac_address": "52:54:00:67:28:80"}
    },
    "hd": [],
    "image": "rhel.img"
  },
  "adaptor_data": {
    "start-timeout": 900,
    "status-timeout": 20,
    "status-retry": 3,
    "internal_status_check": {"active": "on", "ip_address": "10.46.80.14"}
  }
}"#,
    )
    .unwrap();

    assert_eq!(config.vm_data.image, "rhel.img");
    assert_eq!(config.adaptor_data.start_window(), Duration::from_secs(900));
    assert_eq!(config.adaptor_data.status_window(), Duration::from_secs(20));
    assert_eq!(config.adaptor_data.status_retry, 3);
    assert_eq!(
        config.adaptor_data.internal_status_check.target(),
        Some("10.46.80.14")
    );

    let reparsed = InstanceConfig::parse(&config.render().unwrap()).unwrap();
    assert_eq!(reparsed, config);
}

#[test]
fn test_instance_config_rejects_duplicate_interfaces() {
    let result = InstanceConfig::parse(
        r#"{"vm_data": {"cpu": "2", "ram": "256M", "image": "rhel.img",
            "interfaces": {"eth0": {"host_device": "br0"}, "eth0": {"host_device": "br1"}}}}"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_active_check_needs_an_address() {
    let result = InstanceConfig::parse(
        r#"{"vm_data": {"cpu": "2", "ram": "256M", "image": "rhel.img",
            "interfaces": {"eth0": {"host_device": "br0"}}},
            "adaptor_data": {"internal_status_check": {"active": "on"}}}"#,
    );
    assert!(result.is_err());
}
