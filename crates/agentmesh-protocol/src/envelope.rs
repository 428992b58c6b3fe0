use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::ProtocolError;
use crate::identity::{self, Address, AgentKeys, SIGNATURE_LEN};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Signed message envelope
// ============================================================================

/// The signed envelope carried on every gossip topic.
///
/// The signature covers the canonical JSON of the envelope with the
/// `signature` field absent entirely; canonical means this struct's field
/// order with `None` fields omitted. `content` is opaque: ciphertext when
/// `encrypted` is set, raw payload bytes otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedMessage {
    /// Globally unique per sender: `<address>-<ms>-<rand>`.
    pub message_id: String,
    pub from_agent_id: Address,
    /// Absent for broadcast intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_agent_id: Option<Address>,
    #[serde(with = "content_b64")]
    pub content: Vec<u8>,
    pub encrypted: bool,
    /// Milliseconds since epoch at build time.
    pub timestamp: u64,
    /// Uniqueness inside the signed blob; the sender's clock in practice.
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Hex `r ‖ s ‖ v` over the canonical unsigned encoding.
    pub signature: String,
}

/// The unsigned projection serialized for signing. Field order and serde
/// attributes must mirror [`SignedMessage`] exactly, minus `signature`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsignedView<'a> {
    message_id: &'a str,
    from_agent_id: &'a Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_agent_id: Option<&'a Address>,
    #[serde(with = "content_b64")]
    content: &'a [u8],
    encrypted: bool,
    timestamp: u64,
    nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
}

impl SignedMessage {
    /// Build and sign an envelope from this identity.
    pub fn build(
        keys: &AgentKeys,
        to: Option<Address>,
        content: Vec<u8>,
        encrypted: bool,
        conversation_id: Option<String>,
        reply_to: Option<String>,
    ) -> Result<Self, ProtocolError> {
        let now = now_ms();
        let message_id = format!("{}-{}-{}", keys.address(), now, rand::random::<u32>());
        let mut message = Self {
            message_id,
            from_agent_id: keys.address(),
            to_agent_id: to,
            content,
            encrypted,
            timestamp: now,
            nonce: now,
            conversation_id,
            reply_to,
            signature: String::new(),
        };
        let sig = keys.sign(&message.signing_payload()?)?;
        message.signature = format!("0x{}", hex::encode(sig));
        Ok(message)
    }

    /// The canonical bytes the signature covers.
    pub fn signing_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let view = UnsignedView {
            message_id: &self.message_id,
            from_agent_id: &self.from_agent_id,
            to_agent_id: self.to_agent_id.as_ref(),
            content: &self.content,
            encrypted: self.encrypted,
            timestamp: self.timestamp,
            nonce: self.nonce,
            conversation_id: self.conversation_id.as_deref(),
            reply_to: self.reply_to.as_deref(),
        };
        serde_json::to_vec(&view).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Verify that the signature recovers to `fromAgentId`.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let sig = decode_signature(&self.signature)?;
        let recovered = identity::recover_signer(&self.signing_payload()?, &sig)?;
        if recovered != self.from_agent_id {
            return Err(ProtocolError::SignerMismatch {
                claimed: self.from_agent_id,
                recovered,
            });
        }
        Ok(())
    }
}

fn decode_signature(s: &str) -> Result<[u8; SIGNATURE_LEN], ProtocolError> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let bytes =
        hex::decode(stripped).map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidSignature("expected 65 bytes".into()))
}

// ============================================================================
// Outer frame
// ============================================================================

/// The outer wire object: exactly one `message` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Frame {
    pub message: SignedMessage,
}

impl Frame {
    pub fn new(message: SignedMessage) -> Self {
        Self { message }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        check_size(bytes.len())?;
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        check_size(data.len())?;
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: len, limit: MAX_MESSAGE_SIZE });
    }
    Ok(())
}

// ============================================================================
// serde helper: content as base64
// ============================================================================

mod content_b64 {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        B64.decode(s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(keys: &AgentKeys, to: Option<Address>) -> SignedMessage {
        SignedMessage::build(keys, to, b"hello".to_vec(), false, None, None).unwrap()
    }

    #[test]
    fn build_then_verify() {
        let keys = AgentKeys::generate();
        let other = AgentKeys::generate();
        let msg = sample(&keys, Some(other.address()));
        msg.verify().unwrap();
        assert!(msg.message_id.starts_with(&keys.address().to_string()));
    }

    #[test]
    fn frame_round_trip_preserves_signature() {
        let keys = AgentKeys::generate();
        let msg = sample(&keys, None);
        let bytes = Frame::new(msg).encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        decoded.message.verify().unwrap();
    }

    #[test]
    fn flipped_signature_byte_is_rejected() {
        let keys = AgentKeys::generate();
        let mut msg = sample(&keys, None);
        // Flip the first byte of r.
        let mut sig = hex::decode(msg.signature.strip_prefix("0x").unwrap()).unwrap();
        sig[0] ^= 0xFF;
        msg.signature = format!("0x{}", hex::encode(sig));
        assert!(msg.verify().is_err());
    }

    #[test]
    fn modified_content_is_rejected() {
        let keys = AgentKeys::generate();
        let mut msg = sample(&keys, None);
        msg.content = b"forged".to_vec();
        assert!(msg.verify().is_err());
    }

    #[test]
    fn forged_sender_is_rejected() {
        let keys = AgentKeys::generate();
        let imposter = AgentKeys::generate();
        let mut msg = sample(&keys, None);
        msg.from_agent_id = imposter.address();
        assert!(matches!(msg.verify(), Err(ProtocolError::SignerMismatch { .. })));
    }

    #[test]
    fn signing_payload_excludes_signature() {
        let keys = AgentKeys::generate();
        let msg = sample(&keys, None);
        let payload = String::from_utf8(msg.signing_payload().unwrap()).unwrap();
        assert!(!payload.contains("signature"));
        assert!(payload.contains("messageId"));
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let keys = AgentKeys::generate();
        let msg = sample(&keys, None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("toAgentId"));
        assert!(!json.contains("conversationId"));
    }

    #[test]
    fn frame_rejects_extra_fields() {
        let keys = AgentKeys::generate();
        let msg = sample(&keys, None);
        let mut value = serde_json::to_value(Frame::new(msg)).unwrap();
        value["extra"] = serde_json::json!(1);
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let keys = AgentKeys::generate();
        let msg = SignedMessage::build(
            &keys,
            None,
            vec![0u8; MAX_MESSAGE_SIZE],
            false,
            None,
            None,
        )
        .unwrap();
        assert!(matches!(
            Frame::new(msg).encode(),
            Err(ProtocolError::FrameTooLarge { .. }),
        ));
    }

    #[test]
    fn mixed_case_recipient_parses_to_same_address() {
        let keys = AgentKeys::generate();
        let to: Address = "0x7E5F4552091A69125D5DFCB7B8C2659029395BDF".parse().unwrap();
        let msg = sample(&keys, Some(to));
        let bytes = Frame::new(msg).encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(
            decoded.message.to_agent_id.unwrap().to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
        );
    }
}
