use clap::Parser;
use libp2p::Multiaddr;

use crate::role::NodeRole;

// ============================================================================
// Bootstrap registries (compiled-in, one fleet per network)
// ============================================================================
//
// Each network ships four well-known rendezvous peers. The multiaddr is
// always computed from (hostname, port, pinned peer id) — bootstrap
// addresses are never learned from untrusted sources.
// TODO: replace placeholder peer ids with the pinned ids once the fleet is
// deployed; until then these entries fail multiaddr parsing and are skipped
// with a warning, so private meshes must pass --bootstrap.

#[derive(Debug, Clone, Copy)]
pub struct BootstrapEntry {
    pub name: &'static str,
    pub host: &'static str,
    pub port: u16,
    pub peer_id: &'static str,
}

impl BootstrapEntry {
    /// `/dns4/<host>/tcp/<port>/p2p/<peer_id>`.
    pub fn multiaddr(&self) -> Result<Multiaddr, libp2p::multiaddr::Error> {
        format!("/dns4/{}/tcp/{}/p2p/{}", self.host, self.port, self.peer_id).parse()
    }
}

static BOOTSTRAP_BASE: &[BootstrapEntry] = &[
    BootstrapEntry {
        name: "bootstrap-1",
        host: "bootstrap-1.base.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWBase1PlaceholderPeerIdAAAAAAAAAAAAAAAAAAAAAA",
    },
    BootstrapEntry {
        name: "bootstrap-2",
        host: "bootstrap-2.base.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWBase2PlaceholderPeerIdAAAAAAAAAAAAAAAAAAAAAA",
    },
    BootstrapEntry {
        name: "bootstrap-3",
        host: "bootstrap-3.base.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWBase3PlaceholderPeerIdAAAAAAAAAAAAAAAAAAAAAA",
    },
    BootstrapEntry {
        name: "bootstrap-4",
        host: "bootstrap-4.base.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWBase4PlaceholderPeerIdAAAAAAAAAAAAAAAAAAAAAA",
    },
];

static BOOTSTRAP_SEPOLIA: &[BootstrapEntry] = &[
    BootstrapEntry {
        name: "bootstrap-1",
        host: "bootstrap-1.sepolia.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWSepolia1PlaceholderPeerIdAAAAAAAAAAAAAAAAAAA",
    },
    BootstrapEntry {
        name: "bootstrap-2",
        host: "bootstrap-2.sepolia.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWSepolia2PlaceholderPeerIdAAAAAAAAAAAAAAAAAAA",
    },
    BootstrapEntry {
        name: "bootstrap-3",
        host: "bootstrap-3.sepolia.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWSepolia3PlaceholderPeerIdAAAAAAAAAAAAAAAAAAA",
    },
    BootstrapEntry {
        name: "bootstrap-4",
        host: "bootstrap-4.sepolia.agentmesh.dev",
        port: 9000,
        peer_id: "12D3KooWSepolia4PlaceholderPeerIdAAAAAAAAAAAAAAAAAAA",
    },
];

/// The bootstrap fleet for a network. Unknown networks get an empty fleet;
/// the caller decides whether that is fatal.
pub fn bootstrap_set(network: &str) -> &'static [BootstrapEntry] {
    match network {
        "base" => BOOTSTRAP_BASE,
        "sepolia" => BOOTSTRAP_SEPOLIA,
        _ => &[],
    }
}

// ============================================================================
// Configuration surface
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "agentmesh-node", about = "agentmesh overlay node")]
pub struct Config {
    /// 32-byte account secret as hex. Derives the account address, the
    /// signing key, and the encryption keypair.
    #[arg(long, env = "PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    /// On-chain registry contract address. Without it the node runs in dev
    /// mode against an open in-memory registry.
    #[arg(long, env = "REGISTRY_ADDRESS")]
    pub registry_address: Option<String>,

    /// JSON-RPC endpoint for registry reads and the registration write.
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    /// Network context; selects the compiled-in bootstrap fleet.
    #[arg(long, env = "NETWORK", default_value = "sepolia")]
    pub network: String,

    /// Operational role, unless the node is promoted to bootstrap by name.
    #[arg(long, env = "NODE_TYPE", value_enum, default_value_t = NodeRole::Full)]
    pub node_type: NodeRole,

    /// Overlay listen port.
    #[arg(long, env = "P2P_PORT", default_value_t = 9000)]
    pub port: u16,

    /// Display name carried in directory announcements.
    #[arg(long, env = "AGENT_NAME", default_value = "agentmesh-node")]
    pub agent_name: String,

    /// Bootstrap identity name. Matching an entry of the network's
    /// bootstrap fleet promotes the node to the bootstrap role.
    #[arg(long, env = "BOOTSTRAP_NAME")]
    pub bootstrap_name: Option<String>,

    /// Encrypt outbound message content to the recipient's registry key.
    #[arg(long, env = "USE_ENCRYPTION", default_value_t = false)]
    pub use_encryption: bool,

    /// Pinned 32-byte ed25519 overlay secret (hex) for bootstrap peers, so
    /// their peer id survives restarts and matches the compiled-in fleet.
    #[arg(long, env = "BOOTSTRAP_PRIVATE_KEY", hide_env_values = true)]
    pub bootstrap_private_key: Option<String>,

    /// Local API listen address (HTTP + WebSocket), e.g. 127.0.0.1:9470.
    /// If absent, the API server is not started.
    #[arg(long, env = "API_ADDR")]
    pub api_addr: Option<String>,

    /// Additional bootstrap multiaddrs (can repeat). Used by private meshes
    /// and tests.
    #[arg(long)]
    pub bootstrap: Vec<Multiaddr>,

    /// Ignore the compiled-in bootstrap fleet entirely.
    #[arg(long, default_value_t = false)]
    pub no_default_bootstrap: bool,
}

impl Config {
    /// The fleet entry this node runs as, if any.
    pub fn bootstrap_entry(&self) -> Option<&'static BootstrapEntry> {
        let own_name = self.bootstrap_name.as_deref().unwrap_or(&self.agent_name);
        bootstrap_set(&self.network).iter().find(|e| e.name == own_name)
    }

    /// Whether this node is a bootstrap peer: promoted by fleet-name match,
    /// or configured explicitly.
    pub fn resolve_role(&self) -> NodeRole {
        if self.bootstrap_entry().is_some() {
            NodeRole::Bootstrap
        } else {
            self.node_type
        }
    }

    /// Full dial list: user-supplied peers plus the network fleet (minus
    /// self), unless --no-default-bootstrap is set.
    pub fn bootstrap_peers(&self) -> Vec<Multiaddr> {
        let mut peers = self.bootstrap.clone();
        if !self.no_default_bootstrap {
            let own = self.bootstrap_entry().map(|e| e.name);
            for entry in bootstrap_set(&self.network) {
                if Some(entry.name) == own {
                    continue;
                }
                match entry.multiaddr() {
                    Ok(addr) => peers.push(addr),
                    Err(e) => {
                        tracing::warn!("skipping bootstrap entry '{}': {e}", entry.name);
                    }
                }
            }
        }
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["agentmesh-node", "--private-key", "ab".repeat(32).as_str()])
    }

    #[test]
    fn every_network_ships_four_bootstraps() {
        assert_eq!(bootstrap_set("base").len(), 4);
        assert_eq!(bootstrap_set("sepolia").len(), 4);
        assert!(bootstrap_set("devnet-x").is_empty());
    }

    #[test]
    fn role_comes_from_config_by_default() {
        let config = base_config();
        assert_eq!(config.resolve_role(), NodeRole::Full);
    }

    #[test]
    fn fleet_name_promotes_to_bootstrap() {
        let mut config = base_config();
        config.bootstrap_name = Some("bootstrap-2".into());
        assert_eq!(config.resolve_role(), NodeRole::Bootstrap);
        assert_eq!(config.bootstrap_entry().unwrap().host, "bootstrap-2.sepolia.agentmesh.dev");
    }

    #[test]
    fn bootstrap_peers_exclude_self() {
        let mut config = base_config();
        config.bootstrap_name = Some("bootstrap-1".into());
        let own_host = config.bootstrap_entry().unwrap().host;
        for addr in config.bootstrap_peers() {
            assert!(!addr.to_string().contains(own_host));
        }
    }

    #[test]
    fn override_list_is_honored() {
        let mut config = base_config();
        config.no_default_bootstrap = true;
        config.bootstrap = vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()];
        assert_eq!(config.bootstrap_peers().len(), 1);
    }
}
