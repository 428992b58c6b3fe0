pub mod constants;
pub mod ecies;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod identity;
pub mod payload;

pub use constants::*;
pub use envelope::{now_ms, Frame, SignedMessage};
pub use error::ProtocolError;
pub use identity::{Address, AgentKeys};
pub use payload::{Announcement, StatusMetrics, StatusReport};
