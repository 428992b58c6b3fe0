use tiny_keccak::{Hasher, Keccak};

/// Keccak-256 hash of the input bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut k = Keccak::v256();
    let mut out = [0u8; 32];
    k.update(data);
    k.finalize(&mut out);
    out
}

/// Keccak-256 over a prefix-framed message, as used for envelope signing.
///
/// The frame is `"\x19Ethereum Signed Message:\n" + len(message) + message`,
/// so a signed envelope can never be replayed as a raw transaction.
pub fn hash_framed(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut k = Keccak::v256();
    let mut out = [0u8; 32];
    k.update(prefix.as_bytes());
    k.update(message);
    k.finalize(&mut out);
    out
}
