//! Process-scope owner of the node's instance managers.
//!
//! Construction order follows the recovery contract: open the store,
//! initialize the container runtime collaborators, rebuild reservation
//! accounting, recover a manager per stored instance, register the node.
//! `start` spawns the long-lived tasks: heartbeat, placement handler and
//! reservation GC.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterState, Node};
use crate::config::AgentConfig;
use crate::heartbeat;
use crate::initrd::InitrdBuilder;
use crate::instance::manager::{InstanceManager, ManagerOptions, RetryPolicy};
use crate::instance::state::initial_event;
use crate::instance::{Instance, InstanceStatus};
use crate::reservations::{ReservationError, ReservationRequest, ReservationService};
use crate::runtime::Runtime;
use crate::store::Store;
use crate::transport::{
    placement_subject, CreatePayload, PlacementMessage, PlacementType, StopPayload, Subscription,
    Transport,
};

/// The node-local agent.
pub struct Agent {
    config: AgentConfig,
    store: Arc<Store>,
    runtime: Arc<dyn Runtime>,
    transport: Arc<dyn Transport>,
    cluster: Arc<dyn ClusterState>,
    reservations: Arc<ReservationService>,
    initrd: Arc<InitrdBuilder>,
    instances: RwLock<HashMap<String, Arc<InstanceManager>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    // Self-handle for tasks spawned from `&self` contexts. Weak so managers
    // and tasks never keep the agent alive.
    weak_self: Weak<Agent>,
}

impl Agent {
    /// Initialize the agent: open the store, rebuild reservation accounting,
    /// recover every stored instance, register the node record.
    pub async fn new(
        config: AgentConfig,
        runtime: Arc<dyn Runtime>,
        transport: Arc<dyn Transport>,
        cluster: Arc<dyn ClusterState>,
        initrd: Arc<InitrdBuilder>,
    ) -> Result<Arc<Self>> {
        info!(node_id = %config.node_id, address = %config.address, "initializing agent");

        let store = Arc::new(
            Store::open(config.store_path()).context("failed to open state store")?,
        );

        let reservations = Arc::new(ReservationService::new(
            store.clone(),
            config.capacity,
            config.subnet_pool,
            config.gc_interval,
            config.orphan_grace,
        ));
        reservations
            .init()
            .await
            .context("failed to initialize reservation service")?;

        let (shutdown_tx, _) = watch::channel(false);
        let agent = Arc::new_cyclic(|weak_self| Self {
            config,
            store,
            runtime,
            transport,
            cluster,
            reservations,
            initrd,
            instances: RwLock::new(HashMap::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        });

        agent.recover_instances().await?;
        agent.register_node().await?;

        Ok(agent)
    }

    fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            initrd_dir: self.config.initrd_dir(),
            default_stop_grace: self.config.default_stop_grace,
            retry: RetryPolicy::default(),
        }
    }

    /// Build and recover a manager for every instance found in the store.
    async fn recover_instances(&self) -> Result<()> {
        let stored = self.store.list_instances()?;
        info!(count = stored.len(), "recovering instances");

        let mut managers = self.instances.write().await;
        for instance in stored {
            let last_event = match self.store.get_last_instance_event(&instance.id) {
                Ok(event) => event,
                Err(err) => {
                    error!(instance_id = %instance.id, error = %err, "failed to load last event");
                    continue;
                }
            };

            if let Err(err) = self.reservations.get(&instance.machine_id).await {
                // An instance without its reservation cannot be recovered;
                // leave the rows for operator inspection.
                error!(
                    instance_id = %instance.id,
                    machine_id = %instance.machine_id,
                    error = %err,
                    "missing reservation, skipping instance"
                );
                continue;
            }

            let manager = InstanceManager::new(
                self.store.clone(),
                self.cluster.clone(),
                self.runtime.clone(),
                self.reservations.clone(),
                self.initrd.clone(),
                instance.clone(),
                last_event,
                self.manager_options(),
            );

            if let Err(err) = manager.recover().await {
                error!(instance_id = %instance.id, error = %err, "instance recovery failed");
            }
            managers.insert(instance.id.clone(), manager);
        }
        Ok(())
    }

    async fn register_node(&self) -> Result<()> {
        let node = Node {
            id: self.config.node_id.clone(),
            address: self.config.address.clone(),
            region: self.config.region.clone(),
            heartbeated_at: Utc::now(),
        };
        self.store.put_node(&node)?;
        self.cluster
            .put_node(&node)
            .await
            .context("failed to register node in cluster state")?;
        Ok(())
    }

    /// Spawn the long-lived tasks: heartbeat, placement handler, GC.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(heartbeat::run_heartbeat_loop(
            self.config.node_id.clone(),
            self.config.address.clone(),
            self.config.region.clone(),
            self.store.clone(),
            self.cluster.clone(),
            self.config.heartbeat_interval,
            self.shutdown_tx.subscribe(),
        )));

        let subject = placement_subject(&self.config.node_id);
        let subscription = self
            .transport
            .subscribe(&subject)
            .await
            .context("failed to subscribe to placement subject")?;
        info!(subject = %subject, "subscribed to placements");

        let agent = self
            .weak_self
            .upgrade()
            .expect("start is called on a live agent");
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            agent.run_placement_loop(subscription, shutdown).await;
        }));

        let reservations = self.reservations.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            reservations.start_garbage_collection(shutdown).await;
        }));

        Ok(())
    }

    /// Signal shutdown, quiesce tasks, close the store.
    pub async fn stop(&self) {
        info!("stopping agent");
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        self.store.close();
    }

    /// Look up the manager for an instance.
    pub async fn manager(&self, instance_id: &str) -> Option<Arc<InstanceManager>> {
        self.instances.read().await.get(instance_id).cloned()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn reservations(&self) -> &Arc<ReservationService> {
        &self.reservations
    }

    async fn run_placement_loop(
        self: Arc<Self>,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Messages are handled sequentially so commands for the same
        // instance are processed in receive order.
        loop {
            tokio::select! {
                body = subscription.next() => {
                    match body {
                        Some(body) => self.handle_placement_bytes(&body).await,
                        None => {
                            warn!("placement subscription closed");
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("placement handler shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_placement_bytes(&self, body: &[u8]) {
        let message: PlacementMessage = match serde_json::from_slice(body) {
            Ok(message) => message,
            Err(err) => {
                error!(error = %err, "dropping malformed placement message");
                return;
            }
        };
        self.handle_placement(message).await;
    }

    /// Dispatch one placement command. Delivery is at-least-once, so every
    /// arm tolerates duplicates.
    pub async fn handle_placement(&self, message: PlacementMessage) {
        debug!(
            instance_id = %message.instance_id,
            kind = ?message.kind,
            "placement received"
        );

        match message.kind {
            PlacementType::Create => {
                let payload: CreatePayload = match serde_json::from_value(message.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(
                            instance_id = %message.instance_id,
                            error = %err,
                            "dropping create placement with malformed payload"
                        );
                        return;
                    }
                };
                self.handle_create(&message.instance_id, payload).await;
            }
            PlacementType::Stop => {
                let grace = serde_json::from_value::<StopPayload>(message.payload)
                    .unwrap_or_default()
                    .timeout_secs
                    .map(Duration::from_secs);

                let Some(manager) = self.manager(&message.instance_id).await else {
                    debug!(instance_id = %message.instance_id, "stop for unknown instance");
                    return;
                };
                let instance_id = message.instance_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = manager.stop(grace).await {
                        warn!(instance_id = %instance_id, error = %err, "stop placement failed");
                    }
                });
            }
            PlacementType::Destroy => {
                let Some(manager) = self.manager(&message.instance_id).await else {
                    debug!(instance_id = %message.instance_id, "destroy for unknown instance");
                    return;
                };
                let agent = self.weak_self.clone();
                let instance_id = message.instance_id.clone();
                tokio::spawn(async move {
                    match manager.destroy().await {
                        Ok(()) => {
                            if let Some(agent) = agent.upgrade() {
                                agent.instances.write().await.remove(&instance_id);
                            }
                        }
                        Err(err) => {
                            warn!(instance_id = %instance_id, error = %err, "destroy placement failed")
                        }
                    }
                });
            }
        }
    }

    async fn handle_create(&self, instance_id: &str, payload: CreatePayload) {
        if self.instances.read().await.contains_key(instance_id) {
            debug!(instance_id = %instance_id, "duplicate create placement");
            return;
        }

        let reservation = match self
            .reservations
            .create(ReservationRequest {
                machine_id: payload.machine_id.clone(),
                resources: payload.config.resources,
            })
            .await
        {
            Ok(reservation) => reservation,
            Err(ReservationError::AlreadyReserved(_)) => {
                // At-least-once redelivery after a crash between the
                // reservation write and the instance write.
                match self.reservations.get(&payload.machine_id).await {
                    Ok(reservation) => reservation,
                    Err(err) => {
                        error!(instance_id = %instance_id, error = %err, "reservation lookup failed");
                        return;
                    }
                }
            }
            Err(err) => {
                // Admission refused: no instance row, no reservation row.
                warn!(
                    instance_id = %instance_id,
                    machine_id = %payload.machine_id,
                    error = %err,
                    "placement refused"
                );
                return;
            }
        };

        let instance = Instance {
            id: instance_id.to_string(),
            machine_id: payload.machine_id,
            config: payload.config,
            network: reservation.subnet.instance_network(),
            image_config: None,
            status: InstanceStatus::Creating,
            created_at: Utc::now(),
        };

        let event = initial_event(&instance);
        if let Err(err) = self.store.create_instance(&instance, &event) {
            // The reservation stays behind; GC reclaims it after the grace
            // period if this placement is never redelivered.
            error!(instance_id = %instance_id, error = %err, "failed to persist instance");
            return;
        }

        let manager = InstanceManager::new(
            self.store.clone(),
            self.cluster.clone(),
            self.runtime.clone(),
            self.reservations.clone(),
            self.initrd.clone(),
            instance,
            Some(event),
            self.manager_options(),
        );

        self.instances
            .write()
            .await
            .insert(instance_id.to_string(), manager.clone());

        info!(instance_id = %instance_id, "instance accepted");

        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = manager.prepare().await {
                error!(instance_id = %instance_id, error = %err, "prepare failed");
                return;
            }
            if let Err(err) = manager.start().await {
                error!(instance_id = %instance_id, error = %err, "start failed");
            }
        });
    }
}
