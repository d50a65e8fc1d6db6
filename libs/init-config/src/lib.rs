//! Wire types for the in-VM init contract.
//!
//! The node agent serializes an [`InitConfig`] into the initrd at
//! `/ravel/run.json`; the `ravel-init` binary reads it at boot to build the
//! workload's execution environment. Both sides depend on this crate so the
//! schema cannot drift.

use serde::{Deserialize, Serialize};

/// Well-known path of the config document inside the guest.
pub const RUN_CONFIG_PATH: &str = "/ravel/run.json";

/// Name of the init executable record inside the initrd.
pub const INIT_BINARY_NAME: &str = "ravel-init";

/// Complete configuration document shipped in the initrd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    /// Image-provided defaults (from the OCI image config).
    pub image_config: ImageConfig,

    /// User override from the instance config.
    #[serde(default)]
    pub user_override: Option<String>,

    /// Command override from the instance config.
    #[serde(default)]
    pub cmd_override: Option<Vec<String>>,

    /// Entrypoint override from the instance config.
    #[serde(default)]
    pub entrypoint_override: Option<Vec<String>>,

    /// Block device carrying the root filesystem.
    pub root_device: String,

    /// Contents for /etc/resolv.conf.
    pub etc_resolv: EtcResolv,

    /// Extra environment entries (`KEY=VALUE`), appended after the image env.
    #[serde(default)]
    pub extra_env: Vec<String>,

    /// Guest network configuration.
    pub network: NetworkConfig,
}

/// Workload defaults taken from the OCI image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub cmd: Vec<String>,

    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Environment entries in `KEY=VALUE` form.
    #[serde(default)]
    pub env: Vec<String>,
}

/// Nameserver list written to /etc/resolv.conf by the init.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EtcResolv {
    pub nameservers: Vec<String>,
}

/// One address assignment for the guest interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Address with prefix length, e.g. `10.0.0.2/30`.
    pub ip_net: String,

    /// Broadcast address of the subnet.
    pub broadcast: String,

    /// Gateway address of the subnet.
    pub gateway: String,
}

/// Guest network configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address assignments; the init applies the first entry.
    pub ip_configs: Vec<IpConfig>,

    /// Default gateway installed as the guest's default route.
    pub default_gateway: String,
}
