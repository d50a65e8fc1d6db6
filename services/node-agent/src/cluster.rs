//! Cluster state store interface.
//!
//! The fleet-wide gossip store is an external collaborator; the agent only
//! needs to register its node record and publish instance status changes.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::InstanceStatus;

/// This node as seen by the rest of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub region: String,
    pub heartbeated_at: DateTime<Utc>,
}

/// Errors from the cluster state store.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster state unavailable: {0}")]
    Unavailable(String),
}

/// Minimal surface of the fleet-wide state store.
#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn put_node(&self, node: &Node) -> Result<(), ClusterError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    async fn put_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), ClusterError>;
}

/// In-memory cluster state for tests and local development.
#[derive(Default)]
pub struct InMemoryClusterState {
    nodes: Mutex<HashMap<String, Node>>,
    statuses: Mutex<HashMap<String, InstanceStatus>>,
}

impl InMemoryClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last published status of an instance, for assertions.
    pub fn instance_status(&self, instance_id: &str) -> Option<InstanceStatus> {
        self.statuses.lock().unwrap().get(instance_id).copied()
    }
}

#[async_trait]
impl ClusterState for InMemoryClusterState {
    async fn put_node(&self, node: &Node) -> Result<(), ClusterError> {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn put_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), ClusterError> {
        self.statuses
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_registration_and_listing() {
        let cluster = InMemoryClusterState::new();
        let node = Node {
            id: "node-1".to_string(),
            address: "10.1.1.1:8080".to_string(),
            region: "local".to_string(),
            heartbeated_at: Utc::now(),
        };

        cluster.put_node(&node).await.unwrap();
        let nodes = cluster.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "node-1");

        // Re-registration overwrites.
        cluster.put_node(&node).await.unwrap();
        assert_eq!(cluster.list_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn instance_status_tracks_latest() {
        let cluster = InMemoryClusterState::new();
        cluster
            .put_instance_status("inst-1", InstanceStatus::Running)
            .await
            .unwrap();
        cluster
            .put_instance_status("inst-1", InstanceStatus::Stopped)
            .await
            .unwrap();
        assert_eq!(
            cluster.instance_status("inst-1"),
            Some(InstanceStatus::Stopped)
        );
    }
}
