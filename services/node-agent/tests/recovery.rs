//! Recovery tests: the agent restarts over an existing store and reconciles
//! every instance against the container runtime.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use ravel_node_agent::cluster::InMemoryClusterState;
use ravel_node_agent::initrd::InitrdBuilder;
use ravel_node_agent::instance::{
    Instance, InstanceConfig, InstanceEvent, InstanceStatus, Resources,
};
use ravel_node_agent::reservations::{LocalSubnet, Reservation, SubnetPoolConfig};
use ravel_node_agent::runtime::MockRuntime;
use ravel_node_agent::transport::{InProcessTransport, PlacementMessage};
use ravel_node_agent::{Agent, AgentConfig, Store};

fn test_agent_config(dir: &TempDir) -> AgentConfig {
    AgentConfig {
        node_id: "node-1".to_string(),
        address: "127.0.0.1:8080".to_string(),
        region: "local".to_string(),
        data_dir: dir.path().to_path_buf(),
        capacity: Resources {
            cpus: 4,
            memory_bytes: 4 * 1024 * 1024 * 1024,
        },
        subnet_pool: SubnetPoolConfig {
            base: "10.0.0.0".parse().unwrap(),
            base_prefix: 24,
            slice_prefix: 30,
        },
        heartbeat_interval: Duration::from_secs(60),
        gc_interval: Duration::from_secs(60),
        orphan_grace: Duration::from_secs(300),
        default_stop_grace: Duration::from_millis(200),
    }
}

async fn spawn_agent(dir: &TempDir, runtime: Arc<MockRuntime>) -> Arc<Agent> {
    Agent::new(
        test_agent_config(dir),
        runtime,
        Arc::new(InProcessTransport::new()),
        Arc::new(InMemoryClusterState::new()),
        Arc::new(InitrdBuilder::from_bytes(b"\x7fELF-mock-init".to_vec())),
    )
    .await
    .unwrap()
}

fn instance_config() -> InstanceConfig {
    InstanceConfig {
        image: "docker.io/library/busybox:latest".to_string(),
        entrypoint: None,
        cmd: None,
        user: None,
        env: vec![],
        resources: Resources {
            cpus: 1,
            memory_bytes: 64 << 20,
        },
    }
}

async fn wait_for_status(agent: &Arc<Agent>, instance_id: &str, status: InstanceStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(manager) = agent.manager(instance_id).await {
            if manager.status().await == status {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("instance {instance_id} never reached {status}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn recovery_reattaches_live_workload_without_new_event() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MockRuntime::new());

    // First agent lifetime: place the instance and get it running.
    let agent = spawn_agent(&dir, runtime.clone()).await;
    agent
        .handle_placement(PlacementMessage::create(
            "inst-A",
            "machine-A",
            instance_config(),
        ))
        .await;
    wait_for_status(&agent, "inst-A", InstanceStatus::Running).await;
    let events_before = agent.store().list_instance_events("inst-A").unwrap().len();
    agent.stop().await;

    // Second lifetime over the same data dir; the workload survived in the
    // runtime.
    let agent = spawn_agent(&dir, runtime.clone()).await;
    let manager = agent.manager("inst-A").await.unwrap();
    assert_eq!(manager.status().await, InstanceStatus::Running);

    // No new event was appended for a clean re-attach.
    let events_after = agent.store().list_instance_events("inst-A").unwrap();
    assert_eq!(events_after.len(), events_before);

    // The image config persisted at prepare time came back with the
    // instance, so runtime teardown sees real data after a restart.
    let image_config = manager.instance().await.image_config.unwrap();
    assert_eq!(image_config.entrypoint, vec!["/bin/sh"]);

    // The re-attached observer still drives the terminal transition.
    runtime.finish("inst-A", 0);
    wait_for_status(&agent, "inst-A", InstanceStatus::Stopped).await;

    agent.stop().await;
}

#[tokio::test]
async fn recovery_of_dead_workload_appends_one_failed_event() {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(MockRuntime::new());

    let agent = spawn_agent(&dir, runtime.clone()).await;
    agent
        .handle_placement(PlacementMessage::create(
            "inst-A",
            "machine-A",
            instance_config(),
        ))
        .await;
    wait_for_status(&agent, "inst-A", InstanceStatus::Running).await;
    let last_sequence = agent
        .store()
        .get_last_instance_event("inst-A")
        .unwrap()
        .unwrap()
        .sequence;
    agent.stop().await;

    // The runtime lost the workload while the agent was down.
    let agent = spawn_agent(&dir, Arc::new(MockRuntime::new())).await;
    let manager = agent.manager("inst-A").await.unwrap();
    assert_eq!(manager.status().await, InstanceStatus::Failed);

    let last = agent
        .store()
        .get_last_instance_event("inst-A")
        .unwrap()
        .unwrap();
    assert_eq!(last.sequence, last_sequence + 1);
    assert_eq!(last.new_status, InstanceStatus::Failed);
    assert!(last.error.is_some());

    agent.stop().await;
}

/// Seed store rows directly, as left behind by a crashed agent.
fn seed_instance(dir: &TempDir, status: InstanceStatus, statuses: &[InstanceStatus]) {
    let config = test_agent_config(dir);
    let store = Store::open(config.store_path()).unwrap();

    let subnet = LocalSubnet {
        network: "10.0.0.0".parse().unwrap(),
        prefix_len: 30,
    };
    store
        .put_reservation(&Reservation {
            machine_id: "machine-A".to_string(),
            cpus: 1,
            memory_bytes: 64 << 20,
            subnet,
            created_at: Utc::now(),
        })
        .unwrap();

    let instance = Instance {
        id: "inst-A".to_string(),
        machine_id: "machine-A".to_string(),
        config: instance_config(),
        network: subnet.instance_network(),
        image_config: None,
        status,
        created_at: Utc::now(),
    };
    store.put_instance(&instance).unwrap();

    let mut prior = InstanceStatus::Creating;
    for (sequence, new_status) in statuses.iter().enumerate() {
        store
            .append_event(&InstanceEvent {
                instance_id: "inst-A".to_string(),
                sequence: sequence as u64,
                timestamp: Utc::now(),
                prior_status: prior,
                new_status: *new_status,
                error: None,
                payload: None,
            })
            .unwrap();
        prior = *new_status;
    }
    store.close();
}

#[tokio::test]
async fn recovery_fails_instance_interrupted_while_preparing() {
    let dir = TempDir::new().unwrap();
    seed_instance(
        &dir,
        InstanceStatus::Preparing,
        &[InstanceStatus::Creating, InstanceStatus::Preparing],
    );

    let agent = spawn_agent(&dir, Arc::new(MockRuntime::new())).await;
    let manager = agent.manager("inst-A").await.unwrap();
    assert_eq!(manager.status().await, InstanceStatus::Failed);

    let last = agent
        .store()
        .get_last_instance_event("inst-A")
        .unwrap()
        .unwrap();
    assert_eq!(last.sequence, 2);

    agent.stop().await;
}

#[tokio::test]
async fn recovery_resolves_interrupted_stop_to_stopped() {
    let dir = TempDir::new().unwrap();
    seed_instance(
        &dir,
        InstanceStatus::Stopping,
        &[
            InstanceStatus::Creating,
            InstanceStatus::Preparing,
            InstanceStatus::Starting,
            InstanceStatus::Running,
            InstanceStatus::Stopping,
        ],
    );

    // The workload is still hanging around; recovery force-kills it.
    let runtime = Arc::new(MockRuntime::new());
    runtime.seed_running("inst-A");

    let agent = spawn_agent(&dir, runtime).await;
    let manager = agent.manager("inst-A").await.unwrap();
    assert_eq!(manager.status().await, InstanceStatus::Stopped);

    agent.stop().await;
}

#[tokio::test]
async fn recovery_skips_instance_with_missing_reservation() {
    let dir = TempDir::new().unwrap();
    seed_instance(
        &dir,
        InstanceStatus::Running,
        &[InstanceStatus::Creating, InstanceStatus::Preparing],
    );

    // Drop the reservation row from under the instance.
    {
        let config = test_agent_config(&dir);
        let store = Store::open(config.store_path()).unwrap();
        store.delete_reservation("machine-A").unwrap();
        store.close();
    }

    let agent = spawn_agent(&dir, Arc::new(MockRuntime::new())).await;
    assert!(agent.manager("inst-A").await.is_none());
    // The rows are left in place for inspection.
    assert!(agent.store().get_instance("inst-A").is_ok());

    agent.stop().await;
}
