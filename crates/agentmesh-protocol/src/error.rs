use thiserror::Error;

use crate::identity::Address;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("signer mismatch: claimed {claimed}, recovered {recovered}")]
    SignerMismatch { claimed: Address, recovered: Address },

    #[error("ciphertext was not produced for this key")]
    NotForMe,

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("frame too large: {size} bytes exceeds {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}
