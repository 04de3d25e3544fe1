//! cloud-init NoCloud staging files
//!
//! Builds `meta-data` and v1 `network-config` for a guest with one static
//! `eth0`. Gateway and broadcast follow the `a.b.c.1` / `a.b.c.255`
//! convention of the management networks these guests sit on.

use crate::config::defaults::DEFAULT_GUEST_HOSTNAME;
use crate::error::{VmSentryError, VmSentryResult};
use std::net::Ipv4Addr;

/// Static addressing for the guest's `eth0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticInterface {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mac_address: String,
}

impl StaticInterface {
    pub fn parse(address: &str, netmask: &str, mac_address: &str) -> VmSentryResult<Self> {
        let address = address
            .parse()
            .map_err(|_| VmSentryError::validation("address", format!("invalid IPv4 '{}'", address)))?;
        let netmask = netmask
            .parse()
            .map_err(|_| VmSentryError::validation("netmask", format!("invalid IPv4 '{}'", netmask)))?;
        Ok(Self {
            address,
            netmask,
            mac_address: mac_address.to_string(),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.address.octets();
        Ipv4Addr::new(a, b, c, 1)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.address.octets();
        Ipv4Addr::new(a, b, c, 255)
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask))
    }
}

/// `meta-data` lines for `instance_id`
pub fn meta_data_lines(instance_id: &str, iface: &StaticInterface) -> Vec<String> {
    vec![
        format!("instance-id: {}", instance_id),
        format!("local-hostname: {}", DEFAULT_GUEST_HOSTNAME),
        "network-interfaces: \"iface eth0 inet static".to_string(),
        String::new(),
        format!("address {}", iface.address),
        String::new(),
        format!("network {}", iface.network()),
        String::new(),
        format!("netmask {}", iface.netmask),
        String::new(),
        format!("broadcast {}", iface.broadcast()),
        String::new(),
        format!("gateway {}", iface.gateway()),
        String::new(),
        "\"".to_string(),
    ]
}

/// cloud-init network config v1 lines
pub fn network_config_lines(iface: &StaticInterface) -> Vec<String> {
    vec![
        "config:".to_string(),
        format!("- mac_address: {}", iface.mac_address),
        "  name: eth0".to_string(),
        "  subnets:".to_string(),
        format!("  - address: {}", iface.address),
        format!("    gateway: {}", iface.gateway()),
        format!("    netmask: {}", iface.netmask),
        "    type: static".to_string(),
        "  type: physical".to_string(),
        "version: 1".to_string(),
    ]
}
