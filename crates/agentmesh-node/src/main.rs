use std::sync::Arc;

use clap::Parser;

use agentmesh_node::{api, Config, MeshNode};
use agentmesh_protocol::AgentKeys;
use agentmesh_registry::{EthRegistry, MemoryRegistry, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agentmesh=info,libp2p=warn".parse().unwrap()),
        )
        .init();

    let config = Config::parse();
    let keys = Arc::new(
        AgentKeys::from_secret_hex(&config.private_key)
            .map_err(|e| anyhow::anyhow!("PRIVATE_KEY: {e}"))?,
    );

    let registry: Arc<dyn Registry> = match &config.registry_address {
        Some(contract) => {
            let contract = contract
                .parse()
                .map_err(|e| anyhow::anyhow!("REGISTRY_ADDRESS: {e}"))?;
            Arc::new(EthRegistry::new(&config.rpc_url, contract, keys.clone()))
        }
        None => {
            tracing::warn!(
                "no REGISTRY_ADDRESS configured; running in dev mode — \
                 registration is local and the eligibility gate is advisory"
            );
            Arc::new(MemoryRegistry::new(keys.address()))
        }
    };

    let api_addr = config.api_addr.clone();
    let (node, handle, swarm) = MeshNode::new(config, keys, registry)?;

    if let Some(addr_str) = api_addr {
        match addr_str.parse::<std::net::SocketAddr>() {
            Ok(addr) => {
                tokio::spawn(api::serve(handle.clone(), addr));
            }
            Err(e) => tracing::warn!("invalid API_ADDR '{addr_str}': {e}"),
        }
    }

    // SIGINT/SIGTERM take the same cooperative path as POST /stop.
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping");
            signal_handle.stop().await;
        }
    });

    node.run(swarm).await
}
