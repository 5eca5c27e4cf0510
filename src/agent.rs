use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubetail_agent::AgentServer;
use kubetail_k8s::{KubeAuthorizer, KubeClient, PermissionGate};
use kubetail_logs::{EngineCommand, LogFileIndex, LogStreamEngine};

use crate::config::AgentConfig;

/// Run the node agent until interrupted
pub async fn run(config: AgentConfig) -> Result<()> {
    let node_name = config.node_name()?.to_string();

    let kube_config = KubeClient::in_cluster().config(None).await?;
    let authorizer =
        KubeAuthorizer::new(kube_config).context("Failed to create access review client")?;
    let gate = PermissionGate::new(Arc::new(authorizer)).with_timeout(config.request_timeout());

    let shutdown = CancellationToken::new();
    let index = LogFileIndex::new(&config.logs_dir, &node_name);
    let engine = LogStreamEngine::new(
        index,
        gate.clone(),
        EngineCommand::new(&config.engine_path),
        shutdown.clone(),
    );
    let server = AgentServer::new(engine, gate, shutdown.clone());

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to listen on {}", config.addr))?;

    info!(
        node = %node_name,
        logs_dir = %config.logs_dir.display(),
        engine = %config.engine_path.display(),
        "Starting agent"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    server.serve(listener).await?;
    Ok(())
}
