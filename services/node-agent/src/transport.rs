//! Messaging transport interface for placement commands.
//!
//! The cluster scheduler publishes placement commands on
//! `placements.<node_id>`. Delivery is at-least-once, so every handler must
//! be idempotent. The production transport (NATS) is an external
//! collaborator; the in-process implementation backs tests and local
//! development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::instance::InstanceConfig;

/// Errors from the messaging transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Subject carrying placement commands for a node.
pub fn placement_subject(node_id: &str) -> String {
    format!("placements.{node_id}")
}

/// Command kind carried by a placement message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementType {
    Create,
    Stop,
    Destroy,
}

/// A placement command addressed to this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementMessage {
    #[serde(rename = "type")]
    pub kind: PlacementType,

    pub instance_id: String,

    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of a `create` placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayload {
    pub machine_id: String,
    pub config: InstanceConfig,
}

/// Payload of a `stop` placement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopPayload {
    /// Graceful shutdown window in seconds; the agent default applies when
    /// absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PlacementMessage {
    pub fn create(instance_id: &str, machine_id: &str, config: InstanceConfig) -> Self {
        Self {
            kind: PlacementType::Create,
            instance_id: instance_id.to_string(),
            payload: serde_json::to_value(CreatePayload {
                machine_id: machine_id.to_string(),
                config,
            })
            .expect("create payload serializes"),
        }
    }

    pub fn stop(instance_id: &str, timeout_secs: Option<u64>) -> Self {
        Self {
            kind: PlacementType::Stop,
            instance_id: instance_id.to_string(),
            payload: serde_json::to_value(StopPayload { timeout_secs })
                .expect("stop payload serializes"),
        }
    }

    pub fn destroy(instance_id: &str) -> Self {
        Self {
            kind: PlacementType::Destroy,
            instance_id: instance_id.to_string(),
            payload: serde_json::Value::Null,
        }
    }
}

/// A subscription's receive endpoint.
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Next raw message body; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Messaging transport consumed by the agent.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    async fn publish(&self, subject: &str, body: Vec<u8>) -> Result<(), TransportError>;
}

/// In-process transport for tests and local development.
///
/// Messages published to a subject fan out to all of its subscribers with an
/// unbounded-enough buffer; subject matching is exact.
#[derive(Default)]
pub struct InProcessTransport {
    subjects: Mutex<HashMap<String, Vec<mpsc::Sender<Vec<u8>>>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for tests: publish a placement message as JSON.
    pub async fn publish_placement(
        &self,
        node_id: &str,
        message: &PlacementMessage,
    ) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message)
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        self.publish(&placement_subject(node_id), body).await
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(256);
        self.subjects
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription { rx })
    }

    async fn publish(&self, subject: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let senders = {
            let mut subjects = self.subjects.lock().unwrap();
            if let Some(senders) = subjects.get_mut(subject) {
                senders.retain(|tx| !tx.is_closed());
                senders.clone()
            } else {
                Vec::new()
            }
        };

        for tx in senders {
            let _ = tx.send(body.clone()).await;
        }
        Ok(())
    }
}
