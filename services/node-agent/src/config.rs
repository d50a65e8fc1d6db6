//! Agent configuration, environment-driven with defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::instance::Resources;
use crate::reservations::SubnetPoolConfig;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,

    /// Address other fleet members reach this node at.
    pub address: String,

    pub region: String,

    /// Directory holding the state database and built initrd images.
    pub data_dir: PathBuf,

    /// Host capacity handed to the reservation service.
    pub capacity: Resources,

    /// Instance subnet pool.
    pub subnet_pool: SubnetPoolConfig,

    pub heartbeat_interval: Duration,

    /// Reservation GC cadence.
    pub gc_interval: Duration,

    /// Minimum age before an orphan reservation is collected.
    pub orphan_grace: Duration,

    /// Default graceful shutdown window for `stop`.
    pub default_stop_grace: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let node_id = std::env::var("RAVEL_NODE_ID").unwrap_or_else(|_| "node-local".to_string());

        let address =
            std::env::var("RAVEL_ADDRESS").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

        let region = std::env::var("RAVEL_REGION").unwrap_or_else(|_| "local".to_string());

        let data_dir = std::env::var("RAVEL_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/ravel".to_string())
            .into();

        let capacity = Resources {
            cpus: env_parse("RAVEL_CAPACITY_CPUS", 4)?,
            memory_bytes: env_parse("RAVEL_CAPACITY_MEMORY_BYTES", 4 * 1024 * 1024 * 1024)?,
        };

        let subnet_pool = SubnetPoolConfig {
            base: std::env::var("RAVEL_SUBNET_BASE")
                .unwrap_or_else(|_| "10.0.0.0".to_string())
                .parse()
                .context("invalid RAVEL_SUBNET_BASE")?,
            base_prefix: env_parse("RAVEL_SUBNET_BASE_PREFIX", 16)?,
            slice_prefix: env_parse("RAVEL_SUBNET_SLICE_PREFIX", 30)?,
        };

        Ok(Self {
            node_id,
            address,
            region,
            data_dir,
            capacity,
            subnet_pool,
            heartbeat_interval: Duration::from_secs(env_parse("RAVEL_HEARTBEAT_INTERVAL", 10)?),
            gc_interval: Duration::from_secs(env_parse("RAVEL_GC_INTERVAL", 60)?),
            orphan_grace: Duration::from_secs(env_parse("RAVEL_ORPHAN_GRACE", 300)?),
            default_stop_grace: Duration::from_secs(env_parse("RAVEL_STOP_GRACE", 30)?),
        })
    }

    /// Path of the state database.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    /// Directory where per-instance initrd images are written.
    pub fn initrd_dir(&self) -> PathBuf {
        self.data_dir.join("initrd")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("invalid {name}")),
        Err(_) => Ok(default),
    }
}
