//! JSON-RPC 2.0 client for an EVM-hosted registry contract.
//!
//! Reads are `eth_call` against the contract; the single write
//! (`registerAgent`) is a self-signed legacy transaction submitted through
//! `eth_sendRawTransaction` and awaited synchronously via receipt polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use agentmesh_protocol::{Address, AgentKeys};

use crate::abi;
use crate::error::RegistryError;
use crate::tx::LegacyTransaction;
use crate::{AgentRecord, Registry};

/// Gas ceiling used when the node refuses to estimate.
const FALLBACK_GAS_LIMIT: u64 = 500_000;
/// Receipt polling cadence and budget for the registration write.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const RECEIPT_POLL_ATTEMPTS: u32 = 30;

// ============================================================================
// JSON-RPC primitives
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: P,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    to: String,
    data: String,
}

#[derive(Deserialize)]
struct Receipt {
    status: Option<String>,
}

// ============================================================================
// EthRegistry
// ============================================================================

pub struct EthRegistry {
    http: reqwest::Client,
    url: String,
    contract: Address,
    keys: Arc<AgentKeys>,
}

impl EthRegistry {
    pub fn new(rpc_url: &str, contract: Address, keys: Arc<AgentKeys>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: rpc_url.to_owned(),
            contract,
            keys,
        }
    }

    async fn rpc<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<T, RegistryError> {
        let req = JsonRpcRequest { jsonrpc: "2.0", id: 1, method, params };
        let resp: JsonRpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RegistryError::Rpc(format!("{method}: {e}")))?
            .json()
            .await
            .map_err(|e| RegistryError::Rpc(format!("{method} response: {e}")))?;

        match (resp.result, resp.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(RegistryError::Rpc(format!(
                "{method} failed: code={} msg={}",
                err.code, err.message,
            ))),
            (None, None) => Err(RegistryError::Rpc(format!("{method}: empty response"))),
        }
    }

    /// Like [`Self::rpc`], but a `null` result with no error is a valid
    /// answer (`eth_getTransactionReceipt` for a pending transaction).
    async fn rpc_opt<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> Result<Option<T>, RegistryError> {
        let req = JsonRpcRequest { jsonrpc: "2.0", id: 1, method, params };
        let resp: JsonRpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RegistryError::Rpc(format!("{method}: {e}")))?
            .json()
            .await
            .map_err(|e| RegistryError::Rpc(format!("{method} response: {e}")))?;

        match (resp.result, resp.error) {
            (result, None) => Ok(result),
            (_, Some(err)) => Err(RegistryError::Rpc(format!(
                "{method} failed: code={} msg={}",
                err.code, err.message,
            ))),
        }
    }

    /// `eth_call` against the registry contract, returning the raw ABI words.
    async fn contract_call(&self, data: Vec<u8>) -> Result<Vec<u8>, RegistryError> {
        let call = CallObject {
            from: None,
            to: self.contract.to_string(),
            data: format!("0x{}", hex::encode(data)),
        };
        let result: String = self.rpc("eth_call", (call, "latest")).await?;
        hex::decode(result.strip_prefix("0x").unwrap_or(&result))
            .map_err(|e| RegistryError::MalformedResponse(e.to_string()))
    }

    async fn quantity(&self, method: &'static str, params: impl Serialize) -> Result<u128, RegistryError> {
        let result: String = self.rpc(method, params).await?;
        parse_quantity(&result)
    }

    /// Build, sign, and submit the `registerAgent` transaction, then wait for
    /// its receipt.
    async fn submit_registration(&self, calldata: Vec<u8>) -> Result<(), RegistryError> {
        let sender = self.keys.address();
        let chain_id = self.quantity("eth_chainId", serde_json::json!([])).await? as u64;
        let nonce = self
            .quantity("eth_getTransactionCount", (sender.to_string(), "pending"))
            .await? as u64;
        let gas_price = self.quantity("eth_gasPrice", serde_json::json!([])).await?;

        let call = CallObject {
            from: Some(sender.to_string()),
            to: self.contract.to_string(),
            data: format!("0x{}", hex::encode(&calldata)),
        };
        let gas_limit = match self.quantity("eth_estimateGas", (call,)).await {
            Ok(gas) => (gas as u64).saturating_mul(6) / 5,
            Err(e) => {
                tracing::debug!("eth_estimateGas failed ({e}); using fallback gas limit");
                FALLBACK_GAS_LIMIT
            }
        };

        let tx = LegacyTransaction {
            nonce,
            gas_price,
            gas_limit,
            to: self.contract,
            value: 0,
            data: calldata,
        };
        let raw = tx.sign(&self.keys, chain_id)?;

        let tx_hash: String = self
            .rpc("eth_sendRawTransaction", (format!("0x{}", hex::encode(raw)),))
            .await?;
        tracing::info!(tx = %tx_hash, "registration transaction submitted");

        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            let receipt: Option<Receipt> =
                self.rpc_opt("eth_getTransactionReceipt", (tx_hash.clone(),)).await?;
            match receipt.and_then(|r| r.status) {
                Some(status) if parse_quantity(&status)? == 1 => return Ok(()),
                Some(_) => {
                    return Err(RegistryError::Tx(format!("transaction {tx_hash} reverted")));
                }
                None => continue,
            }
        }
        Err(RegistryError::Tx(format!("transaction {tx_hash} not included in time")))
    }
}

#[async_trait]
impl Registry for EthRegistry {
    async fn is_registered(&self, address: Address) -> Result<bool, RegistryError> {
        let data = abi::encode_address_call("isRegistered(address)", address);
        abi::decode_bool(&self.contract_call(data).await?)
    }

    async fn agent_info(&self, address: Address) -> Result<AgentRecord, RegistryError> {
        let data = abi::encode_address_call("getAgentInfo(address)", address);
        match self.contract_call(data).await {
            Ok(raw) if raw.is_empty() => Err(RegistryError::NotFound(address)),
            Ok(raw) => abi::decode_agent_record(&raw),
            // An unregistered address reverts; anything else is a real
            // transport failure.
            Err(RegistryError::Rpc(msg)) if msg.contains("revert") => {
                Err(RegistryError::NotFound(address))
            }
            Err(e) => Err(e),
        }
    }

    async fn register_self(&self, name: &str, metadata: &str) -> Result<(), RegistryError> {
        if self.is_registered(self.keys.address()).await? {
            tracing::info!("agent already registered; skipping registration");
            return Ok(());
        }
        let calldata = abi::encode_register_call(name, metadata);
        match self.submit_registration(calldata).await {
            Ok(()) => Ok(()),
            // A concurrent or earlier registration surfacing as a revert is
            // success for our purposes.
            Err(e) if format!("{e}").to_ascii_lowercase().contains("already registered") => {
                tracing::info!("registration raced an existing entry; treating as success");
                Ok(())
            }
            Err(e) => match self.is_registered(self.keys.address()).await {
                Ok(true) => Ok(()),
                _ => Err(e),
            },
        }
    }
}

/// Parse a JSON-RPC hex quantity (`"0x1a"`).
fn parse_quantity(s: &str) -> Result<u128, RegistryError> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    u128::from_str_radix(stripped, 16)
        .map_err(|e| RegistryError::MalformedResponse(format!("quantity {s}: {e}")))
}
