//! ravel node agent binary.
//!
//! Wires the agent core to its collaborators and runs until interrupted. The
//! production runtime, messaging and cluster backends are injected at this
//! edge; the defaults below use the in-process implementations, which is
//! enough to run the agent on a development machine.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ravel_node_agent::cluster::InMemoryClusterState;
use ravel_node_agent::initrd::InitrdBuilder;
use ravel_node_agent::runtime::MockRuntime;
use ravel_node_agent::transport::InProcessTransport;
use ravel_node_agent::{Agent, AgentConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = AgentConfig::from_env()?;
    info!(node_id = %config.node_id, data_dir = %config.data_dir.display(), "configuration loaded");

    let init_binary = std::env::var("RAVEL_INIT_BINARY")
        .unwrap_or_else(|_| "/usr/local/lib/ravel/ravel-init".to_string());
    let initrd = Arc::new(
        InitrdBuilder::load(std::path::Path::new(&init_binary))
            .with_context(|| format!("failed to load init binary from {init_binary}"))?,
    );

    let runtime = Arc::new(MockRuntime::new());
    let transport = Arc::new(InProcessTransport::new());
    let cluster = Arc::new(InMemoryClusterState::new());

    let agent = Agent::new(config, runtime, transport, cluster, initrd).await?;
    agent.start().await?;
    info!("agent started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    agent.stop().await;
    info!("agent stopped");

    Ok(())
}
