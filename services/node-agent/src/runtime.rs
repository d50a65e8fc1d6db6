//! Container runtime interface and mock implementation.
//!
//! The runtime backend (image pulling, rootfs assembly, hypervisor process
//! management) is an external collaborator consumed through this trait. The
//! mock gives tests scripted control over prepare failures, workload exits
//! and signal behavior.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ravel_init_config::ImageConfig;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::instance::Instance;

/// A runtime-surfaced failure, optionally retryable.
#[derive(Debug, Clone, Error)]
#[error("runtime failure: {message}")]
pub struct RuntimeError {
    pub message: String,
    retryable: bool,
}

impl RuntimeError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Handle to a prepared (pulled + unpacked) instance.
#[derive(Debug, Clone)]
pub struct PreparedHandle {
    pub instance_id: String,

    /// Config of the resolved OCI image, used to build the init config.
    pub image_config: ImageConfig,
}

/// Handle to a running workload.
#[derive(Debug, Clone)]
pub struct RunningHandle {
    pub instance_id: String,
}

/// Exit status of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Signals the manager can send to a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSignal {
    /// Graceful shutdown request.
    Term,
    /// Forced termination.
    Kill,
}

/// Container runtime consumed by instance managers.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Pull and unpack the instance's image; returns a prepared handle.
    async fn prepare(&self, instance: &Instance) -> Result<PreparedHandle, RuntimeError>;

    /// Spawn the workload of a prepared instance.
    async fn start(&self, handle: &PreparedHandle) -> Result<RunningHandle, RuntimeError>;

    /// Suspend until the workload exits.
    async fn wait(&self, running: &RunningHandle) -> Result<ExitStatus, RuntimeError>;

    /// Deliver a signal to the workload.
    async fn signal(
        &self,
        running: &RunningHandle,
        signal: RuntimeSignal,
    ) -> Result<(), RuntimeError>;

    /// Tear down a prepared instance (rootfs and friends).
    async fn destroy(&self, handle: &PreparedHandle) -> Result<(), RuntimeError>;

    /// Probe for a workload left behind by a previous agent process.
    /// `Some` means the workload is still alive and can be observed again.
    async fn reattach(&self, instance_id: &str) -> Result<Option<RunningHandle>, RuntimeError>;
}

struct MockVm {
    running: bool,
    exit_tx: watch::Sender<Option<ExitStatus>>,
}

/// Scriptable in-memory runtime for tests and local development.
pub struct MockRuntime {
    image_config: Mutex<ImageConfig>,
    vms: Mutex<HashMap<String, MockVm>>,
    destroyed: Mutex<HashSet<String>>,
    fail_prepares: AtomicU32,
    fail_prepares_retryable: AtomicBool,
    ignore_term: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            image_config: Mutex::new(ImageConfig {
                user: None,
                working_dir: None,
                cmd: vec!["-c".to_string(), "echo hi".to_string()],
                entrypoint: vec!["/bin/sh".to_string()],
                env: vec!["PATH=/usr/local/bin:/usr/bin:/bin".to_string()],
            }),
            vms: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(HashSet::new()),
            fail_prepares: AtomicU32::new(0),
            fail_prepares_retryable: AtomicBool::new(false),
            ignore_term: AtomicBool::new(false),
        }
    }

    /// Image config returned by subsequent prepares.
    pub fn set_image_config(&self, config: ImageConfig) {
        *self.image_config.lock().unwrap() = config;
    }

    /// Make the next `count` prepares fail.
    pub fn fail_next_prepares(&self, count: u32, retryable: bool) {
        self.fail_prepares.store(count, Ordering::SeqCst);
        self.fail_prepares_retryable
            .store(retryable, Ordering::SeqCst);
    }

    /// Make workloads ignore the graceful shutdown signal.
    pub fn set_ignore_term(&self, ignore: bool) {
        self.ignore_term.store(ignore, Ordering::SeqCst);
    }

    /// Simulate the workload exiting on its own.
    pub fn finish(&self, instance_id: &str, code: i32) {
        let vms = self.vms.lock().unwrap();
        if let Some(vm) = vms.get(instance_id) {
            let _ = vm.exit_tx.send(Some(ExitStatus { code }));
        }
    }

    /// Seed a workload that is already alive, as if started by a previous
    /// agent process. Used by recovery tests.
    pub fn seed_running(&self, instance_id: &str) {
        let (exit_tx, _) = watch::channel(None);
        self.vms.lock().unwrap().insert(
            instance_id.to_string(),
            MockVm {
                running: true,
                exit_tx,
            },
        );
    }

    pub fn is_destroyed(&self, instance_id: &str) -> bool {
        self.destroyed.lock().unwrap().contains(instance_id)
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.vms
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|vm| vm.running)
            .unwrap_or(false)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn prepare(&self, instance: &Instance) -> Result<PreparedHandle, RuntimeError> {
        let remaining = self.fail_prepares.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_prepares.store(remaining - 1, Ordering::SeqCst);
            let retryable = self.fail_prepares_retryable.load(Ordering::SeqCst);
            return Err(if retryable {
                RuntimeError::retryable("mock prepare failure")
            } else {
                RuntimeError::fatal("mock prepare failure")
            });
        }

        let image_config = self.image_config.lock().unwrap().clone();
        let (exit_tx, _) = watch::channel(None);
        self.vms.lock().unwrap().insert(
            instance.id.clone(),
            MockVm {
                running: false,
                exit_tx,
            },
        );

        info!(instance_id = %instance.id, image = %instance.config.image, "[mock] prepared");
        Ok(PreparedHandle {
            instance_id: instance.id.clone(),
            image_config,
        })
    }

    async fn start(&self, handle: &PreparedHandle) -> Result<RunningHandle, RuntimeError> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .get_mut(&handle.instance_id)
            .ok_or_else(|| RuntimeError::fatal("instance not prepared"))?;

        vm.running = true;
        let (exit_tx, _) = watch::channel(None);
        vm.exit_tx = exit_tx;

        debug!(instance_id = %handle.instance_id, "[mock] started");
        Ok(RunningHandle {
            instance_id: handle.instance_id.clone(),
        })
    }

    async fn wait(&self, running: &RunningHandle) -> Result<ExitStatus, RuntimeError> {
        let mut rx = {
            let vms = self.vms.lock().unwrap();
            let vm = vms
                .get(&running.instance_id)
                .ok_or_else(|| RuntimeError::fatal("no such workload"))?;
            vm.exit_tx.subscribe()
        };

        loop {
            if let Some(status) = *rx.borrow_and_update() {
                let mut vms = self.vms.lock().unwrap();
                if let Some(vm) = vms.get_mut(&running.instance_id) {
                    vm.running = false;
                }
                return Ok(status);
            }
            if rx.changed().await.is_err() {
                return Err(RuntimeError::fatal("workload vanished"));
            }
        }
    }

    async fn signal(
        &self,
        running: &RunningHandle,
        signal: RuntimeSignal,
    ) -> Result<(), RuntimeError> {
        let vms = self.vms.lock().unwrap();
        let vm = vms
            .get(&running.instance_id)
            .ok_or_else(|| RuntimeError::fatal("no such workload"))?;

        match signal {
            RuntimeSignal::Term => {
                if !self.ignore_term.load(Ordering::SeqCst) {
                    let _ = vm.exit_tx.send(Some(ExitStatus { code: 0 }));
                }
            }
            RuntimeSignal::Kill => {
                let _ = vm.exit_tx.send(Some(ExitStatus { code: 137 }));
            }
        }
        Ok(())
    }

    async fn destroy(&self, handle: &PreparedHandle) -> Result<(), RuntimeError> {
        self.vms.lock().unwrap().remove(&handle.instance_id);
        self.destroyed
            .lock()
            .unwrap()
            .insert(handle.instance_id.clone());
        debug!(instance_id = %handle.instance_id, "[mock] destroyed");
        Ok(())
    }

    async fn reattach(&self, instance_id: &str) -> Result<Option<RunningHandle>, RuntimeError> {
        let vms = self.vms.lock().unwrap();
        Ok(vms
            .get(instance_id)
            .filter(|vm| vm.running)
            .map(|_| RunningHandle {
                instance_id: instance_id.to_string(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceConfig, InstanceNetwork, InstanceStatus, Resources};
    use chrono::Utc;

    fn test_instance() -> Instance {
        Instance {
            id: "inst-1".to_string(),
            machine_id: "machine-1".to_string(),
            config: InstanceConfig {
                image: "busybox:latest".to_string(),
                entrypoint: None,
                cmd: None,
                user: None,
                env: vec![],
                resources: Resources {
                    cpus: 1,
                    memory_bytes: 1 << 20,
                },
            },
            network: InstanceNetwork {
                ip: "10.0.0.2".parse().unwrap(),
                subnet: "10.0.0.0".parse().unwrap(),
                prefix_len: 30,
                gateway: "10.0.0.1".parse().unwrap(),
                broadcast: "10.0.0.3".parse().unwrap(),
            },
            image_config: None,
            status: InstanceStatus::Creating,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn prepare_start_wait() {
        let runtime = MockRuntime::new();
        let prepared = runtime.prepare(&test_instance()).await.unwrap();
        let running = runtime.start(&prepared).await.unwrap();

        runtime.finish(&running.instance_id, 0);
        let status = runtime.wait(&running).await.unwrap();
        assert!(status.success());
        assert!(!runtime.is_running("inst-1"));
    }

    #[tokio::test]
    async fn scripted_prepare_failures_are_consumed() {
        let runtime = MockRuntime::new();
        runtime.fail_next_prepares(1, true);

        let err = runtime.prepare(&test_instance()).await.unwrap_err();
        assert!(err.is_retryable());

        runtime.prepare(&test_instance()).await.unwrap();
    }

    #[tokio::test]
    async fn term_respects_ignore_flag() {
        let runtime = MockRuntime::new();
        let prepared = runtime.prepare(&test_instance()).await.unwrap();
        let running = runtime.start(&prepared).await.unwrap();

        runtime.set_ignore_term(true);
        runtime.signal(&running, RuntimeSignal::Term).await.unwrap();
        assert!(runtime.is_running("inst-1"));

        runtime.signal(&running, RuntimeSignal::Kill).await.unwrap();
        let status = runtime.wait(&running).await.unwrap();
        assert_eq!(status.code, 137);
    }

    #[tokio::test]
    async fn reattach_only_finds_live_workloads() {
        let runtime = MockRuntime::new();
        assert!(runtime.reattach("inst-1").await.unwrap().is_none());

        runtime.seed_running("inst-1");
        assert!(runtime.reattach("inst-1").await.unwrap().is_some());
    }
}
