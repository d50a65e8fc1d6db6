//! Node heartbeat task.
//!
//! Refreshes the node record in the local store and the cluster state store
//! so the fleet can see this node is alive.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterState, Node};
use crate::store::Store;

/// Run the heartbeat loop until the shutdown signal fires.
pub async fn run_heartbeat_loop(
    node_id: String,
    address: String,
    region: String,
    store: Arc<Store>,
    cluster: Arc<dyn ClusterState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        node_id = %node_id,
        interval_secs = interval.as_secs(),
        "starting heartbeat loop"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let node = Node {
                    id: node_id.clone(),
                    address: address.clone(),
                    region: region.clone(),
                    heartbeated_at: Utc::now(),
                };

                if let Err(err) = store.put_node(&node) {
                    warn!(error = %err, "failed to persist node heartbeat");
                }

                match cluster.put_node(&node).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(node_id = %node_id, "heartbeat published");
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %err, consecutive_failures, "heartbeat failed");
                        } else {
                            error!(error = %err, consecutive_failures, "heartbeat failed repeatedly");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("heartbeat loop shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryClusterState;

    #[tokio::test]
    async fn heartbeat_refreshes_node_record() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cluster = Arc::new(InMemoryClusterState::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_heartbeat_loop(
            "node-1".to_string(),
            "127.0.0.1:8080".to_string(),
            "local".to_string(),
            store.clone(),
            cluster.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("heartbeat must observe shutdown")
            .unwrap();

        assert!(store.get_node().unwrap().is_some());
        assert_eq!(cluster.list_nodes().await.unwrap().len(), 1);
    }
}
