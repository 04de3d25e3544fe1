//! `config.json` model for a VM service
//!
//! The file has two top-level keys: `vm_data` describes the guest and
//! `adaptor_data` tunes how the adaptor drives it.

use crate::config::defaults::*;
use crate::error::{VmSentryError, VmSentryResult};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Parsed `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub vm_data: VmData,
    #[serde(default)]
    pub adaptor_data: AdaptorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmData {
    pub cpu: String,
    pub ram: String,
    #[serde(default, deserialize_with = "unique_interfaces")]
    pub interfaces: BTreeMap<String, InterfaceConfig>,
    #[serde(default)]
    pub hd: Vec<serde_json::Value>,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub host_device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptorData {
    #[serde(rename = "start-timeout")]
    pub start_timeout: u64,
    #[serde(rename = "status-timeout")]
    pub status_timeout: u64,
    #[serde(rename = "status-retry")]
    pub status_retry: u32,
    pub internal_status_check: StatusCheckPolicy,
}

impl Default for AdaptorData {
    fn default() -> Self {
        Self {
            start_timeout: DEFAULT_START_TIMEOUT_SECS,
            status_timeout: DEFAULT_STATUS_TIMEOUT_SECS,
            status_retry: DEFAULT_STATUS_RETRY,
            internal_status_check: StatusCheckPolicy::default(),
        }
    }
}

impl AdaptorData {
    pub fn start_window(&self) -> Duration {
        Duration::from_secs(self.start_timeout)
    }

    pub fn status_window(&self) -> Duration {
        Duration::from_secs(self.status_timeout)
    }
}

/// Whether "running" requires a 200 from the guest's own status endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheckPolicy {
    #[serde(with = "on_off", default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl StatusCheckPolicy {
    pub fn on(ip_address: impl Into<String>) -> Self {
        Self {
            active: true,
            ip_address: Some(ip_address.into()),
        }
    }

    pub fn off() -> Self {
        Self::default()
    }

    /// Address to probe, only when the check is active
    pub fn target(&self) -> Option<&str> {
        if self.active {
            self.ip_address.as_deref()
        } else {
            None
        }
    }
}

impl InstanceConfig {
    /// Minimal config for `image` with the check disabled
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            vm_data: VmData {
                cpu: "2".to_string(),
                ram: "256M".to_string(),
                interfaces: BTreeMap::new(),
                hd: Vec::new(),
                image: image.into(),
            },
            adaptor_data: AdaptorData::default(),
        }
    }

    pub fn with_interface(mut self, name: impl Into<String>, interface: InterfaceConfig) -> Self {
        self.vm_data.interfaces.insert(name.into(), interface);
        self
    }

    pub fn with_status_check(mut self, policy: StatusCheckPolicy) -> Self {
        self.adaptor_data.internal_status_check = policy;
        self
    }

    pub fn with_timeouts(mut self, start: u64, status: u64, retry: u32) -> Self {
        self.adaptor_data.start_timeout = start;
        self.adaptor_data.status_timeout = status;
        self.adaptor_data.status_retry = retry;
        self
    }

    /// Parse and validate `config.json` content
    pub fn parse(content: &str) -> VmSentryResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VmSentryResult<()> {
        if self.vm_data.image.trim().is_empty() {
            return Err(VmSentryError::validation("vm_data.image", "must not be empty"));
        }
        if self.vm_data.image.contains('/') {
            return Err(VmSentryError::validation(
                "vm_data.image",
                "must be a file name inside the image pool",
            ));
        }
        if self.adaptor_data.status_retry == 0 {
            return Err(VmSentryError::validation(
                "adaptor_data.status-retry",
                "must be at least 1",
            ));
        }

        let check = &self.adaptor_data.internal_status_check;
        if check.active {
            if !self.vm_data.interfaces.contains_key("eth0") {
                return Err(VmSentryError::validation(
                    "vm_data.interfaces",
                    "eth0 is required when internal_status_check is on",
                ));
            }
            if check.ip_address.as_deref().map_or(true, str::is_empty) {
                return Err(VmSentryError::validation(
                    "adaptor_data.internal_status_check.ip_address",
                    "required when internal_status_check is on",
                ));
            }
        }
        Ok(())
    }

    /// Pretty-printed JSON split into lines, as staged on a node
    pub fn to_lines(&self) -> VmSentryResult<Vec<String>> {
        let json = serde_json::to_string_pretty(self)?;
        Ok(json.split('\n').map(str::to_string).collect())
    }

    /// File content: the lines joined with a trailing newline
    pub fn render(&self) -> VmSentryResult<String> {
        Ok(join_lines(&self.to_lines()?))
    }
}

/// Join file lines the way nodes write them
pub fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn unique_interfaces<'de, D>(deserializer: D) -> Result<BTreeMap<String, InterfaceConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct InterfacesVisitor;

    impl<'de> Visitor<'de> for InterfacesVisitor {
        type Value = BTreeMap<String, InterfaceConfig>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of interface name to interface config")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut interfaces = BTreeMap::new();
            while let Some((name, interface)) = map.next_entry::<String, InterfaceConfig>()? {
                if interfaces.contains_key(&name) {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate interface '{}'",
                        name
                    )));
                }
                interfaces.insert(name, interface);
            }
            Ok(interfaces)
        }
    }

    deserializer.deserialize_map(InterfacesVisitor)
}

/// `"on"`/`"off"` as written by operators; JSON booleans are accepted too
mod on_off {
    use super::*;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if *value { "on" } else { "off" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Flag {
            Bool(bool),
            Text(String),
        }

        match Flag::deserialize(deserializer)? {
            Flag::Bool(b) => Ok(b),
            Flag::Text(s) => match s.to_ascii_lowercase().as_str() {
                "on" | "true" | "yes" => Ok(true),
                "off" | "false" | "no" => Ok(false),
                other => Err(serde::de::Error::custom(format!(
                    "expected \"on\" or \"off\", got \"{}\"",
                    other
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"{
    "vm_data": {
        "cpu": "2",
        "ram": "256M",
        "interfaces": {
            "eth0": {"host_device": "br0", "ipaddress": "10.10.10.51"}
        },
        "hd": [],
        "image": "rhel.img"
    },
    "adaptor_data": {
        "start-timeout": 600,
        "status-timeout": 600,
        "status-retry": 600,
        "internal_status_check": {"active": "on", "ip_address": "10.10.10.51"}
    }
}"#;

    #[test]
    fn test_parse_config_json() {
        let config = InstanceConfig::parse(CONFIG).unwrap();
        assert_eq!(config.vm_data.image, "rhel.img");
        assert_eq!(config.adaptor_data.status_retry, 600);
        assert_eq!(config.adaptor_data.start_window(), Duration::from_secs(600));
        assert_eq!(
            config.adaptor_data.internal_status_check.target(),
            Some("10.10.10.51")
        );
    }

    #[test]
    fn test_missing_adaptor_data_uses_defaults() {
        let config = InstanceConfig::parse(
            r#"{"vm_data": {"cpu": "1", "ram": "128M", "image": "a.img"}}"#,
        )
        .unwrap();
        assert_eq!(config.adaptor_data, AdaptorData::default());
        assert!(!config.adaptor_data.internal_status_check.active);
        assert_eq!(config.adaptor_data.internal_status_check.target(), None);
    }

    #[test]
    fn test_active_flag_round_trips_as_on_off() {
        let config = InstanceConfig::parse(CONFIG).unwrap();
        let rendered = config.render().unwrap();
        assert!(rendered.contains("\"active\": \"on\""));
        assert!(rendered.ends_with("}\n"));
        assert_eq!(InstanceConfig::parse(&rendered).unwrap(), config);
    }

    #[test]
    fn test_boolean_active_flag_accepted() {
        let json = CONFIG.replace("\"active\": \"on\"", "\"active\": false");
        let config = InstanceConfig::parse(&json).unwrap();
        assert!(!config.adaptor_data.internal_status_check.active);
    }

    #[test]
    fn test_invalid_active_flag_rejected() {
        let json = CONFIG.replace("\"active\": \"on\"", "\"active\": \"maybe\"");
        assert!(matches!(
            InstanceConfig::parse(&json),
            Err(VmSentryError::JsonError(_))
        ));
    }

    #[test]
    fn test_duplicate_interfaces_rejected() {
        let json = CONFIG.replace(
            r#""eth0": {"host_device": "br0", "ipaddress": "10.10.10.51"}"#,
            r#""eth0": {"host_device": "br0"}, "eth0": {"host_device": "br1"}"#,
        );
        let err = InstanceConfig::parse(&json).unwrap_err();
        assert!(err.to_string().contains("duplicate interface 'eth0'"));
    }

    #[test]
    fn test_active_check_requires_eth0_and_address() {
        let config = InstanceConfig::new("rhel.img").with_status_check(StatusCheckPolicy::on("10.0.0.2"));
        assert!(matches!(
            config.validate(),
            Err(VmSentryError::Validation { ref field, .. }) if field == "vm_data.interfaces"
        ));

        let config = InstanceConfig::new("rhel.img")
            .with_interface(
                "eth0",
                InterfaceConfig {
                    host_device: "br0".to_string(),
                    ipaddress: Some("10.0.0.2".to_string()),
                    mac_address: None,
                },
            )
            .with_status_check(StatusCheckPolicy {
                active: true,
                ip_address: None,
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_must_be_pool_file_name() {
        assert!(InstanceConfig::new("../etc/passwd").validate().is_err());
        assert!(InstanceConfig::new("").validate().is_err());
        assert!(InstanceConfig::new("rhel7.img").validate().is_ok());
    }
}
