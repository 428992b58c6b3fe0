//! Minimal ABI codec for the three registry methods.
//!
//! The registry interface is small and fixed, so the encoder covers exactly
//! the shapes it needs: an address argument, a `(string,string)` argument
//! pair, and a `(string,string,uint256,bool,bool,uint256)` return tuple.

use agentmesh_protocol::hash::keccak256;
use agentmesh_protocol::Address;

use crate::error::RegistryError;
use crate::AgentRecord;

const WORD: usize = 32;

/// 4-byte function selector: `keccak256(signature)[..4]`.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Calldata for `isRegistered(address)` / `getAgentInfo(address)`.
pub fn encode_address_call(signature: &str, address: Address) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + WORD);
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(address.as_bytes());
    out
}

/// Calldata for `registerAgent(string,string)`.
pub fn encode_register_call(name: &str, metadata: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&selector("registerAgent(string,string)"));

    let name_tail = encode_string_tail(name);
    // Head: two offsets relative to the start of the argument block.
    push_uint(&mut out, 2 * WORD as u64);
    push_uint(&mut out, (2 * WORD + name_tail.len()) as u64);
    out.extend_from_slice(&name_tail);
    out.extend_from_slice(&encode_string_tail(metadata));
    out
}

/// Decode the single bool returned by `isRegistered`.
pub fn decode_bool(data: &[u8]) -> Result<bool, RegistryError> {
    let word = word_at(data, 0)?;
    Ok(word[WORD - 1] != 0)
}

/// Decode the `(string,string,uint256,bool,bool,uint256)` tuple returned by
/// `getAgentInfo`.
pub fn decode_agent_record(data: &[u8]) -> Result<AgentRecord, RegistryError> {
    let name = decode_string(data, uint_at(data, 0)? as usize)?;
    let metadata = decode_string(data, uint_at(data, 1)? as usize)?;
    let reputation = uint_at(data, 2)?;
    let is_active = word_at(data, 3)?[WORD - 1] != 0;
    let is_blocked = word_at(data, 4)?[WORD - 1] != 0;
    let registration_time = uint_at(data, 5)?;
    Ok(AgentRecord { name, metadata, reputation, is_active, is_blocked, registration_time })
}

// ----------------------------------------------------------------------------
// Word-level helpers
// ----------------------------------------------------------------------------

fn encode_string_tail(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let padded = bytes.len().div_ceil(WORD) * WORD;
    let mut out = Vec::with_capacity(WORD + padded);
    push_uint(&mut out, bytes.len() as u64);
    out.extend_from_slice(bytes);
    out.resize(WORD + padded, 0);
    out
}

fn push_uint(out: &mut Vec<u8>, value: u64) {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    out.extend_from_slice(&word);
}

fn word_at(data: &[u8], index: usize) -> Result<&[u8], RegistryError> {
    data.get(index * WORD..(index + 1) * WORD)
        .ok_or_else(|| RegistryError::MalformedResponse(format!("missing word {index}")))
}

/// Read word `index` as an integer; the value must fit in 64 bits.
fn uint_at(data: &[u8], index: usize) -> Result<u64, RegistryError> {
    let word = word_at(data, index)?;
    if word[..WORD - 8].iter().any(|&b| b != 0) {
        return Err(RegistryError::MalformedResponse(format!("word {index} overflows u64")));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[WORD - 8..]);
    Ok(u64::from_be_bytes(bytes))
}

fn decode_string(data: &[u8], offset: usize) -> Result<String, RegistryError> {
    let len_word = data
        .get(offset..offset + WORD)
        .ok_or_else(|| RegistryError::MalformedResponse("string offset out of range".into()))?;
    if len_word[..WORD - 8].iter().any(|&b| b != 0) {
        return Err(RegistryError::MalformedResponse("string length overflows".into()));
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&len_word[WORD - 8..]);
    let len = u64::from_be_bytes(len_bytes) as usize;
    let bytes = data
        .get(offset + WORD..offset + WORD + len)
        .ok_or_else(|| RegistryError::MalformedResponse("string body out of range".into()))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| RegistryError::MalformedResponse(e.to_string()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
