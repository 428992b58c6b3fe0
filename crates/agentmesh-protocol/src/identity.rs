use std::fmt;
use std::str::FromStr;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;
use crate::hash::{hash_framed, keccak256};

/// Length of a serialized recoverable signature: r(32) ‖ s(32) ‖ v(1).
pub const SIGNATURE_LEN: usize = 65;

/// Length of an uncompressed SEC1 public point.
pub const PUBLIC_KEY_LEN: usize = 65;

// ============================================================================
// Account address
// ============================================================================

/// 20-byte account address: the stable, user-visible identity of an agent.
///
/// Comparison is on the raw bytes, so it is case-insensitive with respect to
/// any hex spelling the address arrived in. Displays as `0x`-prefixed
/// lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; 20]);

impl Address {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derive the address of an uncompressed secp256k1 public point:
    /// the last 20 bytes of `keccak256(point[1..65])`.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Self(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let bytes =
            hex::decode(stripped).map_err(|e| ProtocolError::InvalidAddress(e.to_string()))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidAddress("expected 20 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Agent keys
// ============================================================================

/// Key material derived from the agent's 32-byte secret.
///
/// One secp256k1 keypair drives both envelope signing and ECIES decryption;
/// the account address and the encryption public key are projections of it.
/// The secret never leaves this struct.
pub struct AgentKeys {
    pub(crate) signing: SigningKey,
    address: Address,
    encryption_pub: [u8; PUBLIC_KEY_LEN],
}

impl AgentKeys {
    pub fn from_secret(secret: [u8; 32]) -> Result<Self, ProtocolError> {
        let signing = SigningKey::from_slice(&secret)
            .map_err(|_| ProtocolError::InvalidSecret("not a valid secp256k1 scalar".into()))?;
        let verifying = *signing.verifying_key();
        let address = Address::from_public_key(&verifying);
        let point = verifying.to_encoded_point(false);
        let mut encryption_pub = [0u8; PUBLIC_KEY_LEN];
        encryption_pub.copy_from_slice(point.as_bytes());
        Ok(Self { signing, address, encryption_pub })
    }

    /// Parse a 32-byte hex secret (`0x` optional).
    pub fn from_secret_hex(s: &str) -> Result<Self, ProtocolError> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes =
            hex::decode(stripped).map_err(|e| ProtocolError::InvalidSecret(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProtocolError::InvalidSecret("expected 32 bytes".into()))?;
        Self::from_secret(arr)
    }

    /// Generate a fresh random identity. Used by tests and dev tooling.
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut rand::rngs::OsRng);
        let secret: [u8; 32] = signing.to_bytes().into();
        Self::from_secret(secret).expect("freshly generated key is valid")
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// The uncompressed public point, as published in registry metadata.
    pub fn encryption_public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.encryption_pub
    }

    /// Hex spelling of the encryption public key for `metadata.publicKey`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.encryption_pub)
    }

    /// Sign a prefix-framed message, returning `r ‖ s ‖ v` with v ∈ {27, 28}.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN], ProtocolError> {
        self.sign_digest(hash_framed(message))
    }

    /// Sign a raw 32-byte digest. Used for transaction hashes, which carry
    /// their own framing and must not get the message prefix.
    pub fn sign_digest(&self, digest: [u8; 32]) -> Result<[u8; SIGNATURE_LEN], ProtocolError> {
        let (sig, recovery) = self
            .signing
            .sign_prehash_recoverable(&digest)
            .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = 27 + recovery.to_byte();
        Ok(out)
    }
}

/// Recover the signer address of a prefix-framed message.
pub fn recover_signer(
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<Address, ProtocolError> {
    let digest = hash_framed(message);
    let sig = Signature::from_slice(&signature[..64])
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
    let v = signature[64];
    let recovery = v
        .checked_sub(27)
        .and_then(RecoveryId::from_byte)
        .ok_or_else(|| ProtocolError::InvalidSignature(format!("recovery byte {v}")))?;
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
    Ok(Address::from_public_key(&key))
}

/// True iff `signature` over `message` recovers to `address`.
pub fn verify_signature(address: Address, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
    matches!(recover_signer(message, signature), Ok(recovered) if recovered == address)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_from_known_secret() {
        // The canonical secp256k1 test vector: secret = 1.
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let keys = AgentKeys::from_secret(secret).unwrap();
        assert_eq!(
            keys.address().to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
        );
    }

    #[test]
    fn address_parse_is_case_insensitive() {
        let lower: Address = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".parse().unwrap();
        let upper: Address = "0x7E5F4552091A69125D5DFCB7B8C2659029395BDF".parse().unwrap();
        assert_eq!(lower, upper);
    }

    #[test]
    fn address_rejects_wrong_length() {
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn sign_and_recover_round_trip() {
        let keys = AgentKeys::generate();
        let sig = keys.sign(b"the quick brown fox").unwrap();
        let recovered = recover_signer(b"the quick brown fox", &sig).unwrap();
        assert_eq!(recovered, keys.address());
        assert!(verify_signature(keys.address(), b"the quick brown fox", &sig));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let keys = AgentKeys::generate();
        let sig = keys.sign(b"original").unwrap();
        assert!(!verify_signature(keys.address(), b"tampered", &sig));
    }

    #[test]
    fn tampered_signature_fails_verification() {
        let keys = AgentKeys::generate();
        let mut sig = keys.sign(b"payload").unwrap();
        sig[0] ^= 0xFF;
        assert!(!verify_signature(keys.address(), b"payload", &sig));
    }

    #[test]
    fn zero_secret_is_rejected() {
        assert!(AgentKeys::from_secret([0u8; 32]).is_err());
    }

    #[test]
    fn public_key_hex_is_uncompressed() {
        let keys = AgentKeys::generate();
        let hex = keys.public_key_hex();
        assert_eq!(hex.len(), 130);
        assert!(hex.starts_with("04"));
    }
}
