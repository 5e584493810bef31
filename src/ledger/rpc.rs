//! EVM JSON-RPC ledger backend.
//!
//! Writes go out as signed `storeEvidence` transactions; reads are
//! `eth_call`s of `getEvidence`. Each call is a fresh request, so concurrent
//! uploads share nothing beyond the read-only credential and HTTP pool.

use alloy_primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::abi;
use super::signer::{LedgerCredential, LegacyTx};
use super::{
    AnchorReceipt, AnchorRequest, EvidenceKey, Ledger, LedgerError, LedgerRecord, PendingAnchor,
    ReceiptStatus,
};

#[derive(Debug, Clone)]
pub struct RpcLedgerConfig {
    pub rpc_url: String,
    pub contract: Address,
    /// Overrides `eth_chainId` when set.
    pub chain_id: Option<u64>,
    pub gas_limit: u64,
    pub request_timeout: Duration,
}

pub struct RpcLedger {
    client: Client,
    config: RpcLedgerConfig,
    credential: Arc<LedgerCredential>,
    chain_id: OnceCell<u64>,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl RpcLedger {
    pub fn new(config: RpcLedgerConfig, credential: Arc<LedgerCredential>) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            config,
            credential,
            chain_id: OnceCell::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn signer_address(&self) -> Address {
        self.credential.address()
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!(method, id, "ledger rpc call");
        let res = self
            .client
            .post(&self.config.rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: RpcResponse = res.json().await?;

        if let Some(err) = parsed.error {
            return Err(LedgerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    /// Chain id, fetched once from the node unless configured.
    pub async fn chain_id(&self) -> Result<u64, LedgerError> {
        if let Some(id) = self.config.chain_id {
            return Ok(id);
        }
        self.chain_id
            .get_or_try_init(|| self.node_chain_id())
            .await
            .copied()
    }

    /// Chain id as reported by the node, ignoring any override.
    pub async fn node_chain_id(&self) -> Result<u64, LedgerError> {
        let value = self.call("eth_chainId", json!([])).await?;
        parse_quantity(&value)
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        let value = self.call("eth_gasPrice", json!([])).await?;
        parse_quantity_u128(&value)
    }

    async fn pending_nonce(&self) -> Result<u64, LedgerError> {
        let value = self
            .call(
                "eth_getTransactionCount",
                json!([self.credential.address().to_string(), "pending"]),
            )
            .await?;
        parse_quantity(&value)
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    fn provider(&self) -> &'static str {
        "evm-rpc"
    }

    async fn submit(&self, request: &AnchorRequest) -> Result<PendingAnchor, LedgerError> {
        let chain_id = self.chain_id().await?;
        let nonce = self.pending_nonce().await?;
        let gas_price = self.gas_price().await?;

        let data = abi::encode_store_evidence(&request.key.as_ledger_string(), &request.hash.to_hex());
        let tx = LegacyTx {
            nonce,
            gas_price,
            gas_limit: self.config.gas_limit,
            to: self.config.contract,
            value: U256::ZERO,
            data: Bytes::from(data),
        };
        let signed = self
            .credential
            .sign_legacy(&tx, chain_id)
            .map_err(|e| LedgerError::Signing(e.to_string()))?;

        let returned = self
            .call(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(&signed.raw))]),
            )
            .await?;
        let tx_hash = match returned.as_str() {
            Some(s) => s
                .parse::<TxHash>()
                .map_err(|e| LedgerError::Decode(format!("transaction hash '{}': {}", s, e)))?,
            None => signed.hash,
        };
        if tx_hash != signed.hash {
            debug!(%tx_hash, local = %signed.hash, "node reported a different transaction hash");
        }

        info!(key = %request.key, %tx_hash, nonce, "storeEvidence submitted");
        Ok(PendingAnchor {
            tx_hash,
            key: request.key.clone(),
            hash: request.hash,
            submitted_at: Utc::now(),
        })
    }

    async fn receipt(&self, tx_hash: &TxHash) -> Result<ReceiptStatus, LedgerError> {
        let value = self
            .call("eth_getTransactionReceipt", json!([tx_hash.to_string()]))
            .await?;
        if value.is_null() {
            return Ok(ReceiptStatus::Pending);
        }

        let raw: RawReceipt =
            serde_json::from_value(value).map_err(|e| LedgerError::Decode(e.to_string()))?;
        let block_number = match raw.block_number.as_deref() {
            Some(n) => Some(parse_quantity(&Value::String(n.to_string()))?),
            // Some nodes return a receipt-shaped object for pending txs.
            None => return Ok(ReceiptStatus::Pending),
        };

        match raw.status.as_deref() {
            Some("0x0") => Ok(ReceiptStatus::Reverted {
                tx_hash: raw.transaction_hash,
                block_number,
            }),
            _ => Ok(ReceiptStatus::Mined(AnchorReceipt {
                tx_hash: raw.transaction_hash,
                block_number,
                confirmed_at: Utc::now(),
            })),
        }
    }

    async fn lookup(&self, key: &EvidenceKey) -> Result<Option<LedgerRecord>, LedgerError> {
        let data = abi::encode_get_evidence(&key.as_ledger_string());
        let value = self
            .call(
                "eth_call",
                json!([
                    {
                        "to": self.config.contract.to_string(),
                        "data": format!("0x{}", hex::encode(data)),
                    },
                    "latest"
                ]),
            )
            .await?;

        let hex_str = value
            .as_str()
            .ok_or_else(|| LedgerError::Decode("eth_call result is not a string".into()))?;
        let bytes = decode_hex_data(hex_str)?;
        // A key that was never written reads back as empty return data on
        // some contracts and as ("", 0) on others.
        if bytes.is_empty() {
            return Ok(None);
        }

        let (stored_hash, timestamp) = abi::decode_get_evidence(&bytes)?;
        if stored_hash.is_empty() {
            return Ok(None);
        }
        Ok(Some(LedgerRecord {
            stored_hash,
            timestamp,
            uploader_role: None,
        }))
    }
}

fn decode_hex_data(s: &str) -> Result<Vec<u8>, LedgerError> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(raw).map_err(|e| LedgerError::Decode(format!("hex data: {}", e)))
}

fn parse_quantity_u128(value: &Value) -> Result<u128, LedgerError> {
    let s = value
        .as_str()
        .ok_or_else(|| LedgerError::Decode(format!("expected hex quantity, got {}", value)))?;
    let raw = s.strip_prefix("0x").unwrap_or(s);
    if raw.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(raw, 16).map_err(|e| LedgerError::Decode(format!("quantity '{}': {}", s, e)))
}

fn parse_quantity(value: &Value) -> Result<u64, LedgerError> {
    let wide = parse_quantity_u128(value)?;
    u64::try_from(wide).map_err(|_| LedgerError::Decode(format!("quantity {} exceeds u64", wide)))
}
