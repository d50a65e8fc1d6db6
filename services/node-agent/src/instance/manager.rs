//! Per-instance state machine driving runtime operations.
//!
//! A manager owns the instance's broadcaster, its persisted state, its
//! reservation handle and its runtime handles. Operations (prepare, start,
//! stop, destroy, recover) are serialized by a per-instance lock; the
//! observer task watches the workload and drives the terminal transitions
//! when it exits on its own.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ravel_init_config::ImageConfig;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::{Broadcaster, BroadcasterOptions, Subscriber};
use crate::cluster::ClusterState;
use crate::initrd::{build_init_config, InitrdBuilder};
use crate::instance::state::InstanceState;
use crate::instance::{Instance, InstanceError, InstanceEvent, InstanceStatus};
use crate::reservations::ReservationService;
use crate::runtime::{
    ExitStatus, PreparedHandle, Runtime, RuntimeError, RuntimeSignal, RunningHandle,
};
use crate::store::Store;

/// Replay bound for event subscriptions.
const EVENT_REPLAY_LIMIT: usize = 128;

/// Per-subscriber event buffer.
const EVENT_BUFFER_SIZE: usize = 32;

/// How long a forced kill is given to take effect.
const KILL_WAIT: Duration = Duration::from_secs(10);

/// Capped exponential backoff for retryable runtime errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            attempts: 3,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let millis = self.base.as_millis() as u64 * 2u64.saturating_pow(attempt);
        Duration::from_millis(millis).min(self.max)
    }
}

/// Tunables shared by every manager on a node.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Directory where per-instance initrd images are written.
    pub initrd_dir: PathBuf,

    /// Default graceful shutdown window.
    pub default_stop_grace: Duration,

    pub retry: RetryPolicy,
}

/// Manager of one instance's lifecycle.
pub struct InstanceManager {
    state: Arc<InstanceState>,
    runtime: Arc<dyn Runtime>,
    reservations: Arc<ReservationService>,
    broadcaster: Arc<Broadcaster<InstanceEvent>>,
    initrd: Arc<InitrdBuilder>,
    options: ManagerOptions,

    op_lock: Mutex<()>,
    prepared: Mutex<Option<PreparedHandle>>,
    running: Arc<Mutex<Option<RunningHandle>>>,
    exited: Mutex<Option<watch::Receiver<Option<ExitStatus>>>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        cluster: Arc<dyn ClusterState>,
        runtime: Arc<dyn Runtime>,
        reservations: Arc<ReservationService>,
        initrd: Arc<InitrdBuilder>,
        instance: Instance,
        last_event: Option<InstanceEvent>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let replay_store = store.clone();
        let replay_id = instance.id.clone();
        let broadcaster = Arc::new(Broadcaster::new(BroadcasterOptions {
            buffer_size: EVENT_BUFFER_SIZE,
            replay: Some(Arc::new(move || {
                let mut events = replay_store
                    .list_instance_events(&replay_id)
                    .unwrap_or_default();
                if events.len() > EVENT_REPLAY_LIMIT {
                    events.drain(..events.len() - EVENT_REPLAY_LIMIT);
                }
                events
            })),
        }));
        broadcaster.start();

        let state = Arc::new(InstanceState::new(
            store,
            cluster,
            broadcaster.clone(),
            instance,
            last_event,
        ));

        Arc::new(Self {
            state,
            runtime,
            reservations,
            broadcaster,
            initrd,
            options,
            op_lock: Mutex::new(()),
            prepared: Mutex::new(None),
            running: Arc::new(Mutex::new(None)),
            exited: Mutex::new(None),
            observer: Mutex::new(None),
        })
    }

    pub async fn instance(&self) -> Instance {
        self.state.instance().await
    }

    pub async fn status(&self) -> InstanceStatus {
        self.state.status().await
    }

    pub async fn snapshot(&self) -> (Instance, Option<InstanceEvent>) {
        self.state.snapshot().await
    }

    /// Subscribe to this instance's event stream; the stored log (bounded to
    /// the last 128 events) is replayed before live events.
    pub fn subscribe_events(&self) -> Subscriber<InstanceEvent> {
        self.broadcaster.subscribe()
    }

    async fn retry_runtime<T, F, Fut>(&self, mut op: F) -> Result<T, RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.options.retry.attempts => {
                    let delay = self.options.retry.delay(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retryable runtime error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pull the image, build the initrd. Valid only in `creating`.
    pub async fn prepare(&self) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;

        self.state
            .update_status(InstanceStatus::Preparing, None, None)
            .await?;

        let instance = self.state.instance().await;
        let handle = match self.retry_runtime(|| self.runtime.prepare(&instance)).await {
            Ok(handle) => handle,
            Err(err) => {
                record_failure(&self.state, None, &err.to_string()).await;
                return Err(err.into());
            }
        };

        // Persist the resolved image config so a restarted agent can rebuild
        // an accurate runtime handle for this instance.
        if let Err(err) = self
            .state
            .set_image_config(handle.image_config.clone())
            .await
        {
            record_failure(&self.state, None, &err.to_string()).await;
            return Err(err);
        }

        if let Err(err) = self.write_initrd(&instance, &handle) {
            record_failure(&self.state, None, &err.to_string()).await;
            return Err(err);
        }

        *self.prepared.lock().await = Some(handle);
        info!(instance_id = %instance.id, "instance prepared");
        Ok(())
    }

    fn write_initrd(
        &self,
        instance: &Instance,
        handle: &PreparedHandle,
    ) -> Result<(), InstanceError> {
        let config = build_init_config(instance, &handle.image_config);
        std::fs::create_dir_all(&self.options.initrd_dir)
            .map_err(crate::initrd::InitrdError::from)?;
        let path = self
            .options
            .initrd_dir
            .join(format!("{}.initrd", instance.id));
        let file = std::fs::File::create(&path).map_err(crate::initrd::InitrdError::from)?;
        self.initrd.write(file, &config)?;
        debug!(instance_id = %instance.id, path = %path.display(), "initrd written");
        Ok(())
    }

    /// Spawn the workload. Valid from `preparing` or `stopped`.
    pub async fn start(&self) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), InstanceError> {
        self.state
            .update_status(InstanceStatus::Starting, None, None)
            .await?;

        let prepared = self
            .prepared
            .lock()
            .await
            .clone()
            .ok_or_else(|| RuntimeError::fatal("instance has no prepared handle"))?;

        let running = match self.retry_runtime(|| self.runtime.start(&prepared)).await {
            Ok(running) => running,
            Err(err) => {
                record_failure(&self.state, None, &err.to_string()).await;
                return Err(err.into());
            }
        };

        self.state
            .update_status(InstanceStatus::Running, None, None)
            .await?;

        *self.running.lock().await = Some(running.clone());
        self.spawn_observer(running).await;

        info!(instance_id = %prepared.instance_id, "instance running");
        Ok(())
    }

    /// Watch the workload until it exits and drive the terminal transition.
    async fn spawn_observer(&self, running: RunningHandle) {
        let (exited_tx, exited_rx) = watch::channel(None);
        *self.exited.lock().await = Some(exited_rx);

        let runtime = self.runtime.clone();
        let state = self.state.clone();
        let running_slot = self.running.clone();
        let handle = tokio::spawn(async move {
            observe(runtime, state, running_slot, running, exited_tx).await;
        });

        if let Some(previous) = self.observer.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn wait_exited(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut rx = self.exited.lock().await.clone()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return Some(exit);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    /// Graceful stop with forced escalation after `grace`. Valid from
    /// `starting` or `running`; a no-op when already stopped.
    pub async fn stop(&self, grace: Option<Duration>) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;
        self.stop_locked(grace.unwrap_or(self.options.default_stop_grace))
            .await
    }

    async fn stop_locked(&self, grace: Duration) -> Result<(), InstanceError> {
        let status = self.state.status().await;
        if matches!(status, InstanceStatus::Stopped) {
            return Ok(());
        }

        self.state
            .update_status(InstanceStatus::Stopping, None, None)
            .await?;

        let running = self.running.lock().await.clone();
        let Some(running) = running else {
            // Nothing left to signal; the observer already resolved the exit.
            self.state
                .update_status(InstanceStatus::Stopped, None, None)
                .await?;
            return Ok(());
        };

        if let Err(err) = self.runtime.signal(&running, RuntimeSignal::Term).await {
            warn!(instance_id = %running.instance_id, error = %err, "graceful signal failed");
        }

        let exit = match self.wait_exited(grace).await {
            Some(exit) => Some(exit),
            None => {
                warn!(
                    instance_id = %running.instance_id,
                    grace_secs = grace.as_secs(),
                    "grace period expired, escalating to forced termination"
                );
                if let Err(err) = self.runtime.signal(&running, RuntimeSignal::Kill).await {
                    warn!(instance_id = %running.instance_id, error = %err, "kill signal failed");
                }
                self.wait_exited(KILL_WAIT).await
            }
        };

        match exit {
            Some(exit) => {
                let payload = serde_json::json!({ "exit_code": exit.code });
                self.state
                    .update_status(InstanceStatus::Stopped, Some(payload), None)
                    .await?;
                Ok(())
            }
            None => {
                record_failure(&self.state, None, "workload did not terminate after forced kill")
                    .await;
                Ok(())
            }
        }
    }

    /// Tear the instance down: terminal event, runtime teardown, reservation
    /// release, store removal. Stops the workload first when running.
    /// Idempotent once destroyed.
    pub async fn destroy(&self) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;

        let instance = self.state.instance().await;
        if instance.status == InstanceStatus::Destroyed {
            return Ok(());
        }

        // Stopping is included: the observer records a self-exit as
        // stopping -> stopped without the op lock, so destroy can observe
        // the intermediate status. stop_locked resolves it to stopped.
        if matches!(
            instance.status,
            InstanceStatus::Running | InstanceStatus::Starting | InstanceStatus::Stopping
        ) {
            self.stop_locked(self.options.default_stop_grace).await?;
        }

        self.state
            .update_status(InstanceStatus::Destroyed, None, None)
            .await?;

        if let Some(observer) = self.observer.lock().await.take() {
            observer.abort();
        }

        if let Some(prepared) = self.prepared.lock().await.take() {
            if let Err(err) = self.runtime.destroy(&prepared).await {
                warn!(instance_id = %instance.id, error = %err, "runtime teardown failed");
            }
        }

        self.reservations.release(&instance.machine_id).await?;

        let store_result = self.state.delete_rows().await;
        self.broadcaster.stop();
        store_result?;

        info!(instance_id = %instance.id, "instance destroyed");
        Ok(())
    }

    /// Reconcile this instance after an agent restart, based on its last
    /// persisted status.
    pub async fn recover(&self) -> Result<(), InstanceError> {
        let _guard = self.op_lock.lock().await;
        let instance = self.state.instance().await;

        info!(
            instance_id = %instance.id,
            status = %instance.status,
            "recovering instance"
        );

        match instance.status {
            InstanceStatus::Running | InstanceStatus::Starting => {
                match self.runtime.reattach(&instance.id).await? {
                    Some(running) => {
                        // Re-adopt the handle from the image config persisted
                        // at prepare time, so runtime teardown sees the same
                        // data the previous agent process had.
                        let image_config = instance.image_config.clone().unwrap_or_else(|| {
                            warn!(
                                instance_id = %instance.id,
                                "no stored image config, re-adopting with defaults"
                            );
                            ImageConfig::default()
                        });
                        *self.prepared.lock().await = Some(PreparedHandle {
                            instance_id: instance.id.clone(),
                            image_config,
                        });
                        if instance.status == InstanceStatus::Starting {
                            self.state
                                .update_status(InstanceStatus::Running, None, None)
                                .await?;
                        }
                        *self.running.lock().await = Some(running.clone());
                        self.spawn_observer(running).await;
                        info!(instance_id = %instance.id, "re-attached to live workload");
                    }
                    None => {
                        record_failure(
                            &self.state,
                            None,
                            "workload exited while the agent was offline",
                        )
                        .await;
                    }
                }
            }
            InstanceStatus::Creating | InstanceStatus::Preparing => {
                // The prepared state is gone with the previous process.
                record_failure(&self.state, None, "agent restarted during provisioning").await;
            }
            InstanceStatus::Stopping => {
                if let Some(running) = self.runtime.reattach(&instance.id).await? {
                    let _ = self.runtime.signal(&running, RuntimeSignal::Kill).await;
                }
                self.state
                    .update_status(InstanceStatus::Stopped, None, None)
                    .await?;
            }
            InstanceStatus::Stopped | InstanceStatus::Failed | InstanceStatus::Destroyed => {}
        }

        Ok(())
    }
}

/// Record a failure transition, tolerating states that cannot fail.
async fn record_failure(
    state: &InstanceState,
    payload: Option<serde_json::Value>,
    cause: &str,
) {
    if let Err(err) = state
        .update_status(InstanceStatus::Failed, payload, Some(cause.to_string()))
        .await
    {
        error!(error = %err, cause = %cause, "could not record failure transition");
    }
}

/// Observer task body: wait for the workload to exit and record the outcome.
async fn observe(
    runtime: Arc<dyn Runtime>,
    state: Arc<InstanceState>,
    running_slot: Arc<Mutex<Option<RunningHandle>>>,
    running: RunningHandle,
    exited_tx: watch::Sender<Option<ExitStatus>>,
) {
    let instance_id = running.instance_id.clone();
    match runtime.wait(&running).await {
        Ok(exit) => {
            info!(instance_id = %instance_id, exit_code = exit.code, "workload exited");
            let was_stopping = state.status().await == InstanceStatus::Stopping;
            let _ = exited_tx.send(Some(exit));

            let payload = serde_json::json!({ "exit_code": exit.code });
            if was_stopping || exit.success() {
                // Self-exit walks the same path a requested stop does.
                let _ = state
                    .update_status(InstanceStatus::Stopping, None, None)
                    .await;
                if let Err(err) = state
                    .update_status(InstanceStatus::Stopped, Some(payload), None)
                    .await
                {
                    error!(instance_id = %instance_id, error = %err, "observer could not record stop");
                }
            } else {
                record_failure(
                    &state,
                    Some(payload),
                    &format!("workload crashed with exit code {}", exit.code),
                )
                .await;
            }
        }
        Err(err) => {
            error!(instance_id = %instance_id, error = %err, "observer wait failed");
            let _ = exited_tx.send(Some(ExitStatus { code: -1 }));
            record_failure(&state, None, &err.to_string()).await;
        }
    }
    *running_slot.lock().await = None;
}
