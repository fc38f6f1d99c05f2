use std::sync::Arc;

use anyhow::Context;
use rmcp::{ServiceExt, transport::stdio};
use unity_bridge_mcp::{
    BridgeConfig, BridgeTransport, UnityBridgeMcpServer, UnityConnectionProvider,
    logging::init_logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    log::info!("Unity Bridge MCP Server starting");

    let config = BridgeConfig::load().context("Failed to load bridge configuration")?;
    log::info!(
        "Looking for Unity on {}:{}-{} over {:?}",
        config.unity_host,
        config.unity_port_start,
        config.unity_port_end,
        config.unity_transport
    );

    let transport =
        BridgeTransport::from_config(&config).context("Failed to create Unity transport")?;
    let provider = Arc::new(UnityConnectionProvider::new(transport, config));

    // Unity may start after the server; tools connect on first use
    match provider.acquire().await {
        Ok(lease) => log::info!("Connected to Unity on port {:?}", lease.active_port()),
        Err(e) => log::warn!("Could not connect to Unity on startup: {}", e),
    }

    let server = UnityBridgeMcpServer::new(provider.clone());
    let service = server
        .serve(stdio())
        .await
        .context("Failed to start MCP server")?;
    let quit_reason = service.waiting().await;
    log::info!("MCP server stopped: {:?}", quit_reason);

    provider.disconnect().await;
    log::info!("Unity Bridge MCP Server shut down");
    Ok(())
}
