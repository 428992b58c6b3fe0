//! Legacy EIP-155 transaction assembly for the registry's single write.
//!
//! A full transaction stack is out of scope; the registry client only ever
//! sends `registerAgent`, so a minimal RLP codec and legacy transaction
//! shape are sufficient.

use agentmesh_protocol::hash::keccak256;
use agentmesh_protocol::{Address, AgentKeys};

use crate::error::RegistryError;

#[derive(Debug, Clone)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
}

impl LegacyTransaction {
    /// Keccak-256 of the EIP-155 signing payload:
    /// `rlp([nonce, gasPrice, gas, to, value, data, chainId, 0, 0])`.
    pub fn sighash(&self, chain_id: u64) -> [u8; 32] {
        let mut payload = Vec::new();
        self.encode_body(&mut payload);
        encode_uint(&mut payload, chain_id as u128);
        encode_uint(&mut payload, 0);
        encode_uint(&mut payload, 0);
        keccak256(&encode_list(payload))
    }

    /// Sign with the agent key and produce the raw transaction bytes for
    /// `eth_sendRawTransaction`.
    pub fn sign(&self, keys: &AgentKeys, chain_id: u64) -> Result<Vec<u8>, RegistryError> {
        let sig = keys
            .sign_digest(self.sighash(chain_id))
            .map_err(|e| RegistryError::Tx(e.to_string()))?;
        let recovery = (sig[64] - 27) as u64;
        let v = chain_id * 2 + 35 + recovery;

        let mut payload = Vec::new();
        self.encode_body(&mut payload);
        encode_uint(&mut payload, v as u128);
        encode_bytes(&mut payload, strip_leading_zeros(&sig[..32]));
        encode_bytes(&mut payload, strip_leading_zeros(&sig[32..64]));
        Ok(encode_list(payload))
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        encode_uint(out, self.nonce as u128);
        encode_uint(out, self.gas_price);
        encode_uint(out, self.gas_limit as u128);
        encode_bytes(out, self.to.as_bytes());
        encode_uint(out, self.value);
        encode_bytes(out, &self.data);
    }
}

// ----------------------------------------------------------------------------
// RLP primitives
// ----------------------------------------------------------------------------

fn encode_uint(out: &mut Vec<u8>, value: u128) {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    encode_bytes(out, &bytes[start..]);
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    match bytes.len() {
        1 if bytes[0] < 0x80 => out.push(bytes[0]),
        len if len <= 55 => {
            out.push(0x80 + len as u8);
            out.extend_from_slice(bytes);
        }
        len => {
            let len_bytes = minimal_be(len as u64);
            out.push(0xb7 + len_bytes.len() as u8);
            out.extend_from_slice(&len_bytes);
            out.extend_from_slice(bytes);
        }
    }
}

fn encode_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    match payload.len() {
        len if len <= 55 => out.push(0xc0 + len as u8),
        len => {
            let len_bytes = minimal_be(len as u64);
            out.push(0xf7 + len_bytes.len() as u8);
            out.extend_from_slice(&len_bytes);
        }
    }
    out.extend_from_slice(&payload);
    out
}

fn minimal_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[start..].to_vec()
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
