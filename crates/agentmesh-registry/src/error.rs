use thiserror::Error;

use agentmesh_protocol::Address;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Transport or node failure. Callers must treat this as *unknown*, not
    /// as *unregistered*.
    #[error("registry rpc: {0}")]
    Rpc(String),

    #[error("agent {0} is not registered")]
    NotFound(Address),

    #[error("malformed agent metadata: {0}")]
    MalformedMetadata(String),

    #[error("malformed registry response: {0}")]
    MalformedResponse(String),

    #[error("registration transaction failed: {0}")]
    Tx(String),
}
