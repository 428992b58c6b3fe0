//! Client for the on-chain agent registry.
//!
//! The registry gates overlay membership: an agent may participate iff it is
//! registered, active, and not blocked. This crate caches nothing
//! authoritative — every read goes to the chain, and callers decide their
//! own retry and caching policy.

pub mod abi;
pub mod client;
pub mod error;
pub mod memory;
pub mod tx;

use async_trait::async_trait;

use agentmesh_protocol::ecies;
use agentmesh_protocol::Address;

pub use client::EthRegistry;
pub use error::RegistryError;
pub use memory::MemoryRegistry;

// ============================================================================
// Agent record
// ============================================================================

/// One registry entry, as returned by `getAgentInfo`.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub name: String,
    /// Free-form JSON; carries `publicKey` (hex, uncompressed point) when the
    /// agent accepts encrypted messages.
    pub metadata: String,
    /// Opaque to the node; surfaced for display only.
    pub reputation: u64,
    pub is_active: bool,
    pub is_blocked: bool,
    /// Seconds since epoch.
    pub registration_time: u64,
}

impl AgentRecord {
    /// An agent is eligible to participate iff active and not blocked.
    pub fn eligible(&self) -> bool {
        self.is_active && !self.is_blocked
    }

    /// Parse `metadata.publicKey` into an uncompressed encryption key.
    pub fn public_key(&self) -> Result<Vec<u8>, RegistryError> {
        let doc: serde_json::Value = serde_json::from_str(&self.metadata)
            .map_err(|e| RegistryError::MalformedMetadata(e.to_string()))?;
        let hex_key = doc
            .get("publicKey")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RegistryError::MalformedMetadata("publicKey missing".into()))?;
        let bytes = hex::decode(hex_key.strip_prefix("0x").unwrap_or(hex_key))
            .map_err(|e| RegistryError::MalformedMetadata(e.to_string()))?;
        // Validate that the bytes are a real curve point before handing them
        // to the encryption layer.
        ecies::parse_public_key(&bytes)
            .map_err(|e| RegistryError::MalformedMetadata(e.to_string()))?;
        Ok(bytes)
    }
}

// ============================================================================
// Registry trait
// ============================================================================

/// Read-mostly interface to the registry contract.
///
/// All operations are idempotent at the registry level. Reads have no
/// built-in retry; `register_self` waits for transaction inclusion and
/// treats "already registered" as success.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn is_registered(&self, address: Address) -> Result<bool, RegistryError>;

    /// Fails with [`RegistryError::NotFound`] for an unregistered address.
    async fn agent_info(&self, address: Address) -> Result<AgentRecord, RegistryError>;

    /// The agent's encryption public key from its metadata.
    async fn encryption_key(&self, address: Address) -> Result<Vec<u8>, RegistryError> {
        self.agent_info(address).await?.public_key()
    }

    async fn register_self(&self, name: &str, metadata: &str) -> Result<(), RegistryError>;
}
