//! agentmesh overlay node.
//!
//! Modules mirror the node's moving parts: [`role`] fixes the resource
//! policy per role tag, [`network`] assembles the libp2p stack, [`directory`]
//! keeps the eventually-consistent account→peer mapping, [`node`] owns the
//! event loop, and [`api`] exposes the local control plane.

pub mod api;
pub mod config;
pub mod directory;
pub mod network;
pub mod node;
pub mod role;

pub use api::P2PEvent;
pub use config::Config;
pub use directory::AgentSummary;
pub use node::{MeshNode, NodeHandle, SendError};
pub use role::{NodeRole, RolePolicy};
