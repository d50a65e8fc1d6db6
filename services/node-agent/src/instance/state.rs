//! Per-instance persisted state and derived status.
//!
//! Holds the current instance record and its last event behind a read-write
//! guard. A status update appends the event and rewrites the instance row in
//! one store transaction, swaps the in-memory pair, publishes the event, and
//! pushes the new status to the cluster state store.

use std::sync::Arc;

use chrono::Utc;
use ravel_init_config::ImageConfig;
use tokio::sync::RwLock;
use tracing::warn;

use crate::broadcast::Broadcaster;
use crate::cluster::ClusterState;
use crate::instance::{Instance, InstanceError, InstanceEvent, InstanceStatus};
use crate::store::Store;

struct StateInner {
    instance: Instance,
    last_event: Option<InstanceEvent>,
}

/// In-memory view of one instance, backed by the store.
pub struct InstanceState {
    store: Arc<Store>,
    cluster: Arc<dyn ClusterState>,
    broadcaster: Arc<Broadcaster<InstanceEvent>>,
    inner: RwLock<StateInner>,
}

/// The sequence-0 event written when an instance row is first created.
pub fn initial_event(instance: &Instance) -> InstanceEvent {
    InstanceEvent {
        instance_id: instance.id.clone(),
        sequence: 0,
        timestamp: Utc::now(),
        prior_status: InstanceStatus::Creating,
        new_status: InstanceStatus::Creating,
        error: None,
        payload: None,
    }
}

impl InstanceState {
    pub fn new(
        store: Arc<Store>,
        cluster: Arc<dyn ClusterState>,
        broadcaster: Arc<Broadcaster<InstanceEvent>>,
        instance: Instance,
        last_event: Option<InstanceEvent>,
    ) -> Self {
        Self {
            store,
            cluster,
            broadcaster,
            inner: RwLock::new(StateInner {
                instance,
                last_event,
            }),
        }
    }

    /// Consistent copy of the instance and its last event.
    pub async fn snapshot(&self) -> (Instance, Option<InstanceEvent>) {
        let inner = self.inner.read().await;
        (inner.instance.clone(), inner.last_event.clone())
    }

    pub async fn status(&self) -> InstanceStatus {
        self.inner.read().await.instance.status
    }

    pub async fn instance(&self) -> Instance {
        self.inner.read().await.instance.clone()
    }

    /// Apply a status transition.
    ///
    /// Returns `Ok(None)` when `new_status` equals the current status (a
    /// duplicate command, not an error). An impermissible transition fails
    /// with `InvalidTransition` and leaves both store and memory untouched.
    pub async fn update_status(
        &self,
        new_status: InstanceStatus,
        payload: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Option<InstanceEvent>, InstanceError> {
        let mut inner = self.inner.write().await;
        let current = inner.instance.status;

        if current == new_status {
            return Ok(None);
        }
        if !current.can_transition_to(new_status) {
            return Err(InstanceError::InvalidTransition {
                from: current,
                to: new_status,
            });
        }

        let sequence = match &inner.last_event {
            Some(last) => last.sequence + 1,
            None => 0,
        };

        let event = InstanceEvent {
            instance_id: inner.instance.id.clone(),
            sequence,
            timestamp: Utc::now(),
            prior_status: current,
            new_status,
            error,
            payload,
        };

        let mut instance = inner.instance.clone();
        instance.status = new_status;

        self.store.put_instance_with_event(&instance, &event)?;

        inner.instance = instance;
        inner.last_event = Some(event.clone());

        self.broadcaster.publish(event.clone());

        if let Err(err) = self
            .cluster
            .put_instance_status(&event.instance_id, new_status)
            .await
        {
            warn!(
                instance_id = %event.instance_id,
                error = %err,
                "failed to publish instance status to cluster"
            );
        }

        Ok(Some(event))
    }

    /// Persist the image config resolved during prepare. Not a status
    /// transition, so no event is appended.
    pub async fn set_image_config(&self, image_config: ImageConfig) -> Result<(), InstanceError> {
        let mut inner = self.inner.write().await;
        let mut instance = inner.instance.clone();
        instance.image_config = Some(image_config);
        self.store.put_instance(&instance)?;
        inner.instance = instance;
        Ok(())
    }

    /// Remove the instance row and event log after the terminal transition.
    pub(crate) async fn delete_rows(&self) -> Result<(), InstanceError> {
        let inner = self.inner.read().await;
        self.store.delete_instance(&inner.instance.id)?;
        Ok(())
    }
}
