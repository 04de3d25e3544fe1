//! Default configuration values for vmsentry
//!
//! Harness-wide defaults live here; per-instance defaults for `adaptor_data`
//! are at the bottom of the file.

// Paths
pub const DEFAULT_INSTANCES_ROOT: &str = "/var/lib/libvirt/instances";
pub const DEFAULT_IMAGES_ROOT: &str = "/var/lib/libvirt/images";
pub const DEFAULT_ADAPTOR_LOG: &str = "/var/log/messages";

// Lifecycle
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_BOOT_WAIT_SECS: u64 = 300;
pub const DEFAULT_CONSOLE_PROMPT: &str = "vm-service-host.localdomain login:";
pub const DEFAULT_GUEST_HOSTNAME: &str = "vm-service-host";

// Internal status probe
pub const DEFAULT_PROBE_PORT: u16 = 9999;
pub const DEFAULT_PROBE_PATH: &str = "/";
pub const DEFAULT_PROBE_REQUEST_TIMEOUT_SECS: u64 = 2;

// Per-instance adaptor_data
pub const DEFAULT_START_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_STATUS_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STATUS_RETRY: u32 = 5;

// Instance directory layout
pub const CONFIG_FILE: &str = "config.json";
pub const META_DATA_FILE: &str = "meta-data";
pub const NETWORK_CONFIG_FILE: &str = "network-config";
pub const USER_DATA_FILE: &str = "user-data";
pub const LIVE_SUFFIX: &str = ".live";
pub const ARCHIVE_DIR: &str = "last_undefined_vm";
