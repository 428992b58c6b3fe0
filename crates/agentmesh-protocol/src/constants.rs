// ============================================================================
// Wire constants
// ============================================================================

/// Gossip topic carrying application messages between agents.
pub const TOPIC_MESSAGES: &str = "agent-messages";

/// Gossip topic carrying directory announcements.
pub const TOPIC_ANNOUNCEMENTS: &str = "agent-announcements";

/// Gossip topic carrying periodic node status reports.
pub const TOPIC_STATUS: &str = "node-status";

/// Maximum encoded frame size in bytes (envelope + content).
pub const MAX_MESSAGE_SIZE: usize = 65_536; // 64 KiB

/// Namespace under which account-address bindings are provided in the DHT.
pub const DHT_KEY_PREFIX: &str = "/eth/";

/// Seconds a peer status report is retained before it ages out.
pub const STATUS_TTL_SECS: u64 = 120;

/// Cadence of the node's own status broadcast.
pub const STATUS_INTERVAL_SECS: u64 = 60;

use crate::identity::Address;

/// DHT provider key for an account address: `/eth/<lowercase-address>`.
pub fn dht_key(address: Address) -> String {
    format!("{DHT_KEY_PREFIX}{address}")
}
