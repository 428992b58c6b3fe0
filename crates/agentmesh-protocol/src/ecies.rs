//! Hybrid public-key encryption on secp256k1.
//!
//! Ciphertext layout: `ephemeral_pub(65) ‖ nonce(24) ‖ aead_output`, where the
//! AEAD key is HKDF-SHA256 of the ECDH shared secret and the AEAD is
//! XChaCha20-Poly1305. The ciphertext is self-contained: the recipient needs
//! only its own secret to decrypt.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use k256::ecdh::EphemeralSecret;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::ProtocolError;
use crate::identity::{AgentKeys, PUBLIC_KEY_LEN};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Domain separation for the derived AEAD key.
const KDF_INFO: &[u8] = b"agentmesh/ecies/v1";

/// Encrypt `plaintext` so that only the holder of `recipient_public`'s secret
/// can read it.
pub fn encrypt(recipient_public: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let recipient = parse_public_key(recipient_public)?;

    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_pub = ephemeral.public_key().to_encoded_point(false);
    let shared = ephemeral.diffie_hellman(&recipient);
    let key = derive_key(shared.raw_secret_bytes().as_slice());

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| ProtocolError::Encrypt("AEAD sealing failed".into()))?;

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + sealed.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

impl AgentKeys {
    /// Decrypt an ECIES ciphertext produced for this identity.
    ///
    /// Any failure — truncated input, an invalid ephemeral point, or an AEAD
    /// tag mismatch — is reported as `NotForMe`: the caller cannot tell a
    /// foreign ciphertext from bytes that were never encrypted, and is
    /// expected to fall back to treating the input as plaintext.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        if data.len() < PUBLIC_KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::NotForMe);
        }
        let ephemeral = PublicKey::from_sec1_bytes(&data[..PUBLIC_KEY_LEN])
            .map_err(|_| ProtocolError::NotForMe)?;
        let shared = k256::ecdh::diffie_hellman(self.signing.as_nonzero_scalar(), ephemeral.as_affine());
        let key = derive_key(shared.raw_secret_bytes().as_slice());

        let nonce = &data[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + NONCE_LEN];
        let sealed = &data[PUBLIC_KEY_LEN + NONCE_LEN..];

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| ProtocolError::NotForMe)
    }
}

/// Parse an encryption public key: the 65-byte uncompressed SEC1 point, or
/// the 64-byte form without the `0x04` tag (some registrants strip it).
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, ProtocolError> {
    match bytes.len() {
        PUBLIC_KEY_LEN => PublicKey::from_sec1_bytes(bytes)
            .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string())),
        64 => {
            let mut tagged = [0u8; PUBLIC_KEY_LEN];
            tagged[0] = 0x04;
            tagged[1..].copy_from_slice(bytes);
            PublicKey::from_sec1_bytes(&tagged)
                .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))
        }
        other => Err(ProtocolError::InvalidPublicKey(format!("unexpected length {other}"))),
    }
}

fn derive_key(shared: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut out = [0u8; 32];
    hk.expand(KDF_INFO, &mut out)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let keys = AgentKeys::generate();
        let ct = encrypt(keys.encryption_public_key(), b"attack at dawn").unwrap();
        assert_eq!(keys.decrypt(&ct).unwrap(), b"attack at dawn");
    }

    #[test]
    fn ciphertext_differs_from_plaintext() {
        let keys = AgentKeys::generate();
        let ct = encrypt(keys.encryption_public_key(), b"hello").unwrap();
        assert!(!ct.windows(5).any(|w| w == b"hello"));
    }

    #[test]
    fn wrong_recipient_is_not_for_me() {
        let alice = AgentKeys::generate();
        let mallory = AgentKeys::generate();
        let ct = encrypt(alice.encryption_public_key(), b"secret").unwrap();
        assert!(matches!(mallory.decrypt(&ct), Err(ProtocolError::NotForMe)));
    }

    #[test]
    fn plaintext_bytes_are_not_for_me() {
        let keys = AgentKeys::generate();
        assert!(matches!(keys.decrypt(b"just some plaintext"), Err(ProtocolError::NotForMe)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let keys = AgentKeys::generate();
        let mut ct = encrypt(keys.encryption_public_key(), b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(matches!(keys.decrypt(&ct), Err(ProtocolError::NotForMe)));
    }

    #[test]
    fn untagged_public_key_is_accepted() {
        let keys = AgentKeys::generate();
        let ct = encrypt(&keys.encryption_public_key()[1..], b"ping").unwrap();
        assert_eq!(keys.decrypt(&ct).unwrap(), b"ping");
    }
}
