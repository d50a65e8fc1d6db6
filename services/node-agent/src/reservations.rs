//! Admission control over host resources.
//!
//! A reservation holds CPU shares, memory, and one IPv4 subnet slice for a
//! machine id. All checks and the store write happen under one exclusive
//! guard so concurrent placements cannot double-book capacity. A background
//! GC releases reservations whose instance row never materialized.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::instance::{InstanceNetwork, Resources};
use crate::store::{Store, StoreError};

/// Errors from reservation admission.
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("insufficient resources: requested {requested_cpus} cpus / {requested_memory_bytes} bytes, available {available_cpus} cpus / {available_memory_bytes} bytes")]
    InsufficientResources {
        requested_cpus: u64,
        requested_memory_bytes: u64,
        available_cpus: u64,
        available_memory_bytes: u64,
    },

    #[error("address pool exhausted")]
    AddressPoolExhausted,

    #[error("machine {0} already has a reservation")]
    AlreadyReserved(String),

    #[error("no reservation for machine {0}")]
    NotFound(String),

    #[error("reservation service not initialized")]
    NotInitialized,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One IPv4 subnet slice handed to an instance.
///
/// Within a slice: network = .0, gateway = .1, instance = .2, broadcast =
/// the last address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSubnet {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
}

impl LocalSubnet {
    fn size(&self) -> u32 {
        1u32 << (32 - self.prefix_len)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    pub fn instance_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 2)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + self.size() - 1)
    }

    /// Network view handed to the instance record.
    pub fn instance_network(&self) -> InstanceNetwork {
        InstanceNetwork {
            ip: self.instance_ip(),
            subnet: self.network,
            prefix_len: self.prefix_len,
            gateway: self.gateway(),
            broadcast: self.broadcast(),
        }
    }
}

/// A hold on host resources, keyed by machine id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub machine_id: String,
    pub cpus: u64,
    pub memory_bytes: u64,
    pub subnet: LocalSubnet,
    pub created_at: DateTime<Utc>,
}

/// Configuration of the node's instance subnet pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubnetPoolConfig {
    /// Base network the pool slices, e.g. `10.0.0.0`.
    pub base: Ipv4Addr,

    /// Prefix length of the base network, e.g. 16.
    pub base_prefix: u8,

    /// Prefix length of each slice, e.g. 30. Must leave room for network,
    /// gateway, instance and broadcast addresses.
    pub slice_prefix: u8,
}

struct SubnetPool {
    config: SubnetPoolConfig,
    allocated: BTreeSet<u32>,
}

impl SubnetPool {
    fn new(config: SubnetPoolConfig) -> Self {
        Self {
            config,
            allocated: BTreeSet::new(),
        }
    }

    fn capacity(&self) -> u32 {
        1u32 << (self.config.slice_prefix - self.config.base_prefix)
    }

    fn subnet_at(&self, index: u32) -> LocalSubnet {
        let slice_size = 1u32 << (32 - self.config.slice_prefix);
        LocalSubnet {
            network: Ipv4Addr::from(u32::from(self.config.base) + index * slice_size),
            prefix_len: self.config.slice_prefix,
        }
    }

    fn index_of(&self, subnet: &LocalSubnet) -> Option<u32> {
        let slice_size = 1u32 << (32 - self.config.slice_prefix);
        let offset = u32::from(subnet.network).checked_sub(u32::from(self.config.base))?;
        let index = offset / slice_size;
        (index < self.capacity()).then_some(index)
    }

    /// Lowest-indexed free slice first, for determinism.
    fn allocate(&mut self) -> Option<LocalSubnet> {
        let index = (0..self.capacity()).find(|i| !self.allocated.contains(i))?;
        self.allocated.insert(index);
        Some(self.subnet_at(index))
    }

    fn mark_allocated(&mut self, subnet: &LocalSubnet) {
        if let Some(index) = self.index_of(subnet) {
            self.allocated.insert(index);
        }
    }

    fn release(&mut self, subnet: &LocalSubnet) {
        if let Some(index) = self.index_of(subnet) {
            self.allocated.remove(&index);
        }
    }
}

struct Accounting {
    initialized: bool,
    reserved: Resources,
    reservations: HashMap<String, Reservation>,
    pool: SubnetPool,
}

/// A request for a new reservation.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub machine_id: String,
    pub resources: Resources,
}

/// Admission control service over the node's declared capacity.
pub struct ReservationService {
    store: Arc<Store>,
    capacity: Resources,
    gc_interval: Duration,
    orphan_grace: Duration,
    inner: Mutex<Accounting>,
}

impl ReservationService {
    pub fn new(
        store: Arc<Store>,
        capacity: Resources,
        pool: SubnetPoolConfig,
        gc_interval: Duration,
        orphan_grace: Duration,
    ) -> Self {
        Self {
            store,
            capacity,
            gc_interval,
            orphan_grace,
            inner: Mutex::new(Accounting {
                initialized: false,
                reserved: Resources {
                    cpus: 0,
                    memory_bytes: 0,
                },
                reservations: HashMap::new(),
                pool: SubnetPool::new(pool),
            }),
        }
    }

    /// Rebuild accounting from the store. The service refuses requests until
    /// this has completed.
    pub async fn init(&self) -> Result<(), ReservationError> {
        let mut inner = self.inner.lock().await;

        let stored = self.store.list_reservations()?;
        for reservation in stored {
            inner.reserved.cpus += reservation.cpus;
            inner.reserved.memory_bytes += reservation.memory_bytes;
            inner.pool.mark_allocated(&reservation.subnet);
            inner
                .reservations
                .insert(reservation.machine_id.clone(), reservation);
        }

        inner.initialized = true;
        info!(
            reservations = inner.reservations.len(),
            reserved_cpus = inner.reserved.cpus,
            reserved_memory_bytes = inner.reserved.memory_bytes,
            "reservation accounting rebuilt"
        );
        Ok(())
    }

    /// Admit a reservation or fail with a typed refusal.
    pub async fn create(
        &self,
        request: ReservationRequest,
    ) -> Result<Reservation, ReservationError> {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            return Err(ReservationError::NotInitialized);
        }

        if inner.reservations.contains_key(&request.machine_id) {
            return Err(ReservationError::AlreadyReserved(request.machine_id));
        }

        // Saturating: a shrunk capacity config must not panic on rebuild.
        let available_cpus = self.capacity.cpus.saturating_sub(inner.reserved.cpus);
        let available_memory = self
            .capacity
            .memory_bytes
            .saturating_sub(inner.reserved.memory_bytes);
        if request.resources.cpus > available_cpus
            || request.resources.memory_bytes > available_memory
        {
            return Err(ReservationError::InsufficientResources {
                requested_cpus: request.resources.cpus,
                requested_memory_bytes: request.resources.memory_bytes,
                available_cpus,
                available_memory_bytes: available_memory,
            });
        }

        let subnet = inner
            .pool
            .allocate()
            .ok_or(ReservationError::AddressPoolExhausted)?;

        let reservation = Reservation {
            machine_id: request.machine_id.clone(),
            cpus: request.resources.cpus,
            memory_bytes: request.resources.memory_bytes,
            subnet,
            created_at: Utc::now(),
        };

        if let Err(err) = self.store.put_reservation(&reservation) {
            // Roll back the in-memory allocation; nothing was persisted.
            inner.pool.release(&subnet);
            return Err(err.into());
        }

        inner.reserved.cpus += reservation.cpus;
        inner.reserved.memory_bytes += reservation.memory_bytes;
        inner
            .reservations
            .insert(reservation.machine_id.clone(), reservation.clone());

        debug!(
            machine_id = %reservation.machine_id,
            cpus = reservation.cpus,
            memory_bytes = reservation.memory_bytes,
            subnet = %reservation.subnet.network,
            "reservation created"
        );
        Ok(reservation)
    }

    pub async fn get(&self, machine_id: &str) -> Result<Reservation, ReservationError> {
        let inner = self.inner.lock().await;
        if !inner.initialized {
            return Err(ReservationError::NotInitialized);
        }
        inner
            .reservations
            .get(machine_id)
            .cloned()
            .ok_or_else(|| ReservationError::NotFound(machine_id.to_string()))
    }

    /// Release a reservation. Idempotent.
    pub async fn release(&self, machine_id: &str) -> Result<(), ReservationError> {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            return Err(ReservationError::NotInitialized);
        }

        if let Some(reservation) = inner.reservations.remove(machine_id) {
            inner.reserved.cpus -= reservation.cpus;
            inner.reserved.memory_bytes -= reservation.memory_bytes;
            inner.pool.release(&reservation.subnet);
            self.store.delete_reservation(machine_id)?;
            debug!(machine_id = %machine_id, "reservation released");
        } else {
            // May still exist in the store from a partially-recovered state.
            self.store.delete_reservation(machine_id)?;
        }
        Ok(())
    }

    /// Resources currently reserved, for reporting.
    pub async fn reserved(&self) -> Resources {
        self.inner.lock().await.reserved
    }

    /// Periodic orphan collection. Runs until the cancel signal fires.
    ///
    /// An orphan is a reservation whose machine id has no instance row and
    /// whose age exceeds the configured grace period (a crash between the
    /// reservation write and the instance write leaves exactly this state).
    pub async fn start_garbage_collection(&self, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = self.gc_interval.as_secs(),
            grace_secs = self.orphan_grace.as_secs(),
            "starting reservation garbage collection"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.collect_orphans().await {
                        error!(error = %err, "reservation gc pass failed");
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("reservation gc shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn collect_orphans(&self) -> Result<(), ReservationError> {
        let reservations = self.store.list_reservations()?;
        let instances = self.store.list_instances()?;
        let held: HashSet<String> = instances.into_iter().map(|i| i.machine_id).collect();

        let now = Utc::now();
        for reservation in reservations {
            if held.contains(&reservation.machine_id) {
                continue;
            }
            let age = now
                .signed_duration_since(reservation.created_at)
                .to_std()
                .unwrap_or_default();
            if age < self.orphan_grace {
                continue;
            }
            warn!(
                machine_id = %reservation.machine_id,
                age_secs = age.as_secs(),
                "releasing orphan reservation"
            );
            self.release(&reservation.machine_id).await?;
        }
        Ok(())
    }
}
