//! In-memory registry for dev mode and tests.
//!
//! The node falls back to this implementation when no `REGISTRY_ADDRESS` is
//! configured: everyone is admitted and registration is a local insert. The
//! agent table is shared, so multiple node instances in one process (the
//! integration tests) observe each other's registrations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;

use agentmesh_protocol::Address;

use crate::error::RegistryError;
use crate::{AgentRecord, Registry};

#[derive(Clone)]
pub struct MemoryRegistry {
    self_address: Address,
    agents: Arc<RwLock<HashMap<Address, AgentRecord>>>,
}

impl MemoryRegistry {
    pub fn new(self_address: Address) -> Self {
        Self { self_address, agents: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// A registry view for another agent sharing the same table.
    pub fn for_agent(&self, self_address: Address) -> Self {
        Self { self_address, agents: Arc::clone(&self.agents) }
    }

    /// Insert or replace an arbitrary record. Test-setup hook.
    pub async fn seed(&self, address: Address, record: AgentRecord) {
        self.agents.write().await.insert(address, record);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn is_registered(&self, address: Address) -> Result<bool, RegistryError> {
        Ok(self.agents.read().await.contains_key(&address))
    }

    async fn agent_info(&self, address: Address) -> Result<AgentRecord, RegistryError> {
        self.agents
            .read()
            .await
            .get(&address)
            .cloned()
            .ok_or(RegistryError::NotFound(address))
    }

    async fn register_self(&self, name: &str, metadata: &str) -> Result<(), RegistryError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut agents = self.agents.write().await;
        // Re-registration keeps the original timestamp; the call is
        // idempotent like the contract's.
        let registration_time = agents
            .get(&self.self_address)
            .map(|r| r.registration_time)
            .unwrap_or(now);
        agents.insert(
            self.self_address,
            AgentRecord {
                name: name.to_owned(),
                metadata: metadata.to_owned(),
                reputation: 0,
                is_active: true,
                is_blocked: false,
                registration_time,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_protocol::AgentKeys;

    #[tokio::test]
    async fn register_then_lookup() {
        let keys = AgentKeys::generate();
        let registry = MemoryRegistry::new(keys.address());
        assert!(!registry.is_registered(keys.address()).await.unwrap());

        let metadata = format!(r#"{{"publicKey":"{}"}}"#, keys.public_key_hex());
        registry.register_self("alice", &metadata).await.unwrap();

        assert!(registry.is_registered(keys.address()).await.unwrap());
        let record = registry.agent_info(keys.address()).await.unwrap();
        assert_eq!(record.name, "alice");
        assert!(record.eligible());
        assert_eq!(
            registry.encryption_key(keys.address()).await.unwrap(),
            keys.encryption_public_key().to_vec(),
        );
    }

    #[tokio::test]
    async fn double_registration_is_idempotent() {
        let keys = AgentKeys::generate();
        let registry = MemoryRegistry::new(keys.address());
        registry.register_self("alice", "{}").await.unwrap();
        let first = registry.agent_info(keys.address()).await.unwrap().registration_time;
        registry.register_self("alice", "{}").await.unwrap();
        let second = registry.agent_info(keys.address()).await.unwrap().registration_time;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn shared_table_is_visible_across_views() {
        let alice = AgentKeys::generate();
        let bob = AgentKeys::generate();
        let registry = MemoryRegistry::new(alice.address());
        registry.register_self("alice", "{}").await.unwrap();

        let bob_view = registry.for_agent(bob.address());
        assert!(bob_view.is_registered(alice.address()).await.unwrap());
        assert!(matches!(
            bob_view.agent_info(bob.address()).await,
            Err(RegistryError::NotFound(_)),
        ));
    }
}
