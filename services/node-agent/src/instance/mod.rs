//! Instance model: records, event log entries, and the status machine.

pub mod manager;
pub mod state;

use chrono::{DateTime, Utc};
use ravel_init_config::ImageConfig;
use serde::{Deserialize, Serialize};

use crate::reservations::ReservationError;
use crate::runtime::RuntimeError;
use crate::store::StoreError;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Preparing,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Destroyed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Preparing => "preparing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }

    /// Whether moving from `self` to `to` is a permitted transition.
    pub fn can_transition_to(&self, to: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (*self, to),
            (Creating, Preparing)
                | (Creating, Failed)
                | (Creating, Destroyed)
                | (Preparing, Starting)
                | (Preparing, Failed)
                | (Preparing, Destroyed)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
                | (Stopped, Starting)
                | (Stopped, Destroyed)
                | (Failed, Destroyed)
        )
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested resources for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU shares.
    pub cpus: u64,

    /// Memory in bytes.
    pub memory_bytes: u64,
}

/// Workload configuration carried by a create placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Image reference, e.g. `docker.io/library/busybox:latest`.
    pub image: String,

    /// Entrypoint override.
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,

    /// Command override.
    #[serde(default)]
    pub cmd: Option<Vec<String>>,

    /// User override.
    #[serde(default)]
    pub user: Option<String>,

    /// Extra environment entries (`KEY=VALUE`).
    #[serde(default)]
    pub env: Vec<String>,

    /// Requested resources.
    pub resources: Resources,
}

/// Network assignment derived from the instance's reservation.
///
/// Set once when the reservation is bound; immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceNetwork {
    pub ip: std::net::Ipv4Addr,
    pub subnet: std::net::Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: std::net::Ipv4Addr,
    pub broadcast: std::net::Ipv4Addr,
}

impl InstanceNetwork {
    /// Instance address in CIDR notation, e.g. `10.0.0.2/30`.
    pub fn ip_net(&self) -> String {
        format!("{}/{}", self.ip, self.prefix_len)
    }
}

/// A workload instance hosted (or to be hosted) on this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Globally unique instance id.
    pub id: String,

    /// Logical workload identity; reservations are keyed by this.
    pub machine_id: String,

    pub config: InstanceConfig,

    pub network: InstanceNetwork,

    /// Image config resolved by the runtime during prepare; persisted so a
    /// restarted agent can rebuild runtime handles accurately.
    #[serde(default)]
    pub image_config: Option<ImageConfig>,

    pub status: InstanceStatus,

    pub created_at: DateTime<Utc>,
}

/// Immutable record of one status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub instance_id: String,

    /// Contiguous, strictly increasing from 0 per instance.
    pub sequence: u64,

    pub timestamp: DateTime<Utc>,

    pub prior_status: InstanceStatus,

    pub new_status: InstanceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Errors from instance state and manager operations.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error("initrd build failed: {0}")]
    Initrd(#[from] crate::initrd::InitrdError),

    #[error("operation cancelled")]
    Cancelled,
}
