use std::time::Duration;

// ============================================================================
// Node roles
// ============================================================================

/// Operational role of a node. The role fixes the resource policy; it never
/// changes for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum NodeRole {
    /// Well-known rendezvous peer with a pinned overlay keypair.
    Bootstrap,
    /// Default participating peer.
    Full,
    /// High-capacity peer.
    Server,
    /// Constrained peer: no DHT, no gossip fan-out duties.
    Light,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Bootstrap => "bootstrap",
            Self::Full => "full",
            Self::Server => "server",
            Self::Light => "light",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Role policy
// ============================================================================

/// The full configuration bundle derived from a role tag.
///
/// `for_role` is a pure function: same tag, same bundle, no environment
/// input. Everything the engine, directory, and messaging layers tune by
/// role comes from here.
#[derive(Debug, Clone)]
pub struct RolePolicy {
    pub max_connections: usize,
    pub min_connections: usize,
    pub max_parallel_dials: usize,
    pub dial_timeout: Duration,
    pub auto_dial_interval: Duration,
    pub enable_dht: bool,
    pub dht_server_mode: bool,
    pub k_bucket_size: usize,
    pub enable_gossip: bool,
    pub gossip_heartbeat: Duration,
    pub allow_publish_to_zero_peers: bool,
    pub emit_self: bool,
    pub relay_messages: bool,
    pub bootstrap_required: bool,
    pub dht_update_interval: Duration,
    pub min_dht_update_interval: Duration,
}

impl RolePolicy {
    pub fn for_role(role: NodeRole) -> Self {
        match role {
            NodeRole::Bootstrap => Self {
                max_connections: 1000,
                min_connections: 3,
                max_parallel_dials: 100,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(10),
                enable_dht: true,
                dht_server_mode: true,
                k_bucket_size: 200,
                enable_gossip: true,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: true,
                emit_self: true,
                relay_messages: false,
                bootstrap_required: false,
                dht_update_interval: Duration::from_secs(30),
                min_dht_update_interval: Duration::from_secs(10),
            },
            NodeRole::Full => Self {
                max_connections: 50,
                min_connections: 1,
                max_parallel_dials: 25,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(10),
                enable_dht: true,
                dht_server_mode: false,
                k_bucket_size: 20,
                enable_gossip: true,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: true,
                emit_self: true,
                relay_messages: false,
                bootstrap_required: true,
                dht_update_interval: Duration::from_secs(60),
                min_dht_update_interval: Duration::from_secs(20),
            },
            NodeRole::Server => Self {
                max_connections: 100,
                min_connections: 2,
                max_parallel_dials: 50,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(10),
                enable_dht: true,
                dht_server_mode: false,
                k_bucket_size: 20,
                enable_gossip: true,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: true,
                emit_self: true,
                relay_messages: true,
                bootstrap_required: true,
                dht_update_interval: Duration::from_secs(45),
                min_dht_update_interval: Duration::from_secs(15),
            },
            NodeRole::Light => Self {
                max_connections: 10,
                min_connections: 1,
                max_parallel_dials: 10,
                dial_timeout: Duration::from_secs(30),
                auto_dial_interval: Duration::from_secs(20),
                enable_dht: false,
                dht_server_mode: false,
                k_bucket_size: 0,
                enable_gossip: false,
                gossip_heartbeat: Duration::from_secs(1),
                allow_publish_to_zero_peers: false,
                emit_self: true,
                relay_messages: false,
                bootstrap_required: true,
                dht_update_interval: Duration::from_secs(120),
                min_dht_update_interval: Duration::from_secs(30),
            },
        }
    }

    /// Cadence for publishing our own directory binding, bounded below so a
    /// misconfigured role table cannot cause announcement storms.
    pub fn announce_interval(&self) -> Duration {
        self.dht_update_interval.max(self.min_dht_update_interval)
    }
}
