//! Typed payloads carried in envelope content on the directory and status
//! topics. Application messages on `agent-messages` stay opaque.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::Address;

// ============================================================================
// Directory announcement (topic: agent-announcements)
// ============================================================================

/// Self-asserted binding between an account address and an overlay peer.
///
/// Only trusted after the enclosing envelope's signature has been verified
/// and `fromAgentId == address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub peer_id: String,
    pub address: Address,
    pub name: String,
    pub multiaddrs: Vec<String>,
    pub timestamp: u64,
}

impl Announcement {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

// ============================================================================
// Status report (topic: node-status)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub peer_id: String,
    pub metrics: StatusMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMetrics {
    pub connected_peers: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub uptime_sec: u64,
    pub routing_table_size: usize,
    pub multiaddrs: Vec<String>,
    pub is_bootstrap: bool,
    pub last_message_ms: u64,
}

impl StatusReport {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trip() {
        let ann = Announcement {
            peer_id: "12D3KooWExample".into(),
            address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".parse().unwrap(),
            name: "agent-a".into(),
            multiaddrs: vec!["/ip4/127.0.0.1/tcp/9000".into()],
            timestamp: 1_700_000_000_000,
        };
        let decoded = Announcement::decode(&ann.encode().unwrap()).unwrap();
        assert_eq!(decoded.address, ann.address);
        assert_eq!(decoded.multiaddrs, ann.multiaddrs);
    }

    #[test]
    fn status_uses_camel_case_keys() {
        let report = StatusReport {
            peer_id: "12D3KooWExample".into(),
            metrics: StatusMetrics {
                connected_peers: 3,
                messages_sent: 10,
                messages_received: 7,
                uptime_sec: 60,
                routing_table_size: 4,
                multiaddrs: vec![],
                is_bootstrap: false,
                last_message_ms: 0,
            },
        };
        let json = String::from_utf8(report.encode().unwrap()).unwrap();
        assert!(json.contains("connectedPeers"));
        assert!(json.contains("routingTableSize"));
    }
}
