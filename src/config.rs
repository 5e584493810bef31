//! Service configuration, read once from the environment at startup.

use alloy_primitives::Address;
use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{AnchorPolicy, RetryPolicy};
use crate::ledger::{LedgerCredential, RpcLedgerConfig};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;
pub const DEFAULT_GAS_LIMIT: u64 = 300_000;

/// Which ledger backend to talk to.
#[derive(Debug, Clone)]
pub enum LedgerConfig {
    Local { path: PathBuf },
    Rpc {
        rpc: RpcLedgerConfig,
        credential: Arc<LedgerCredential>,
    },
}

#[derive(Debug, Clone)]
pub struct LockerConfig {
    pub bind_addr: SocketAddr,
    pub max_upload_bytes: u64,
    pub data_dir: PathBuf,
    pub ledger: LedgerConfig,
    pub anchor: AnchorPolicy,
}

impl LockerConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind_addr = parse_or(&get, "LOCKER_BIND_ADDR", "0.0.0.0:5000".parse::<SocketAddr>()?)?;
        let max_upload_bytes = parse_or(&get, "LOCKER_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?;
        if max_upload_bytes == 0 {
            bail!("LOCKER_MAX_UPLOAD_BYTES must be greater than zero");
        }
        let data_dir = PathBuf::from(get("LOCKER_DATA_DIR").unwrap_or_else(|| "locker_data".into()));

        let confirm_timeout = Duration::from_secs(parse_or(&get, "LOCKER_CONFIRM_TIMEOUT_SECS", 60u64)?);
        let poll_interval = Duration::from_millis(parse_or(&get, "LOCKER_POLL_INTERVAL_MS", 1000u64)?);
        if poll_interval.is_zero() {
            bail!("LOCKER_POLL_INTERVAL_MS must be greater than zero");
        }
        let max_attempts = parse_or(&get, "LOCKER_SUBMIT_ATTEMPTS", 3u32)?;
        if max_attempts == 0 {
            bail!("LOCKER_SUBMIT_ATTEMPTS must be at least 1");
        }
        let readback = parse_bool_or(&get, "LOCKER_READBACK", true)?;

        let anchor = AnchorPolicy {
            retry: RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
            confirm_timeout,
            poll_interval,
            readback,
        };

        let ledger = match get("RPC_URL") {
            None => LedgerConfig::Local {
                path: data_dir.join("ledger.jsonl"),
            },
            Some(rpc_url) => {
                let key = get("PRIVATE_KEY").ok_or_else(|| anyhow!("PRIVATE_KEY is required when RPC_URL is set"))?;
                let credential = LedgerCredential::from_hex(&key).context("PRIVATE_KEY is invalid")?;
                let contract = get("CONTRACT_ADDRESS")
                    .ok_or_else(|| anyhow!("CONTRACT_ADDRESS is required when RPC_URL is set"))?;
                let contract = Address::from_str(&contract)
                    .map_err(|e| anyhow!("CONTRACT_ADDRESS '{}' is invalid: {}", contract, e))?;
                let chain_id = get("LOCKER_CHAIN_ID")
                    .map(|v| v.parse::<u64>().with_context(|| format!("LOCKER_CHAIN_ID '{}' is invalid", v)))
                    .transpose()?;

                LedgerConfig::Rpc {
                    rpc: RpcLedgerConfig {
                        rpc_url,
                        contract,
                        chain_id,
                        gas_limit: parse_or(&get, "LOCKER_GAS_LIMIT", DEFAULT_GAS_LIMIT)?,
                        request_timeout: Duration::from_secs(30),
                    },
                    credential: Arc::new(credential),
                }
            }
        };

        Ok(Self {
            bind_addr,
            max_upload_bytes,
            data_dir,
            ledger,
            anchor,
        })
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.db")
    }
}

fn parse_or<G, T>(get: &G, name: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("{} '{}' is invalid: {}", name, raw, e)),
    }
}

fn parse_bool_or<G>(get: &G, name: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("{} '{}' is not a boolean", name, v),
        },
    }
}
