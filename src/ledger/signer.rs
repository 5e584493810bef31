//! Signing credential and EIP-155 legacy transactions.
//!
//! The credential is parsed once at startup and shared read-only. It never
//! leaves this module in any printable form.

use alloy_primitives::{keccak256, Address, Bytes, TxHash, U256};
use alloy_rlp::RlpEncodable;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("private key is not valid hex")]
    NotHex,
    #[error("private key must be 32 bytes, got {0}")]
    WrongLength(usize),
    #[error("private key is not a valid secp256k1 scalar")]
    InvalidScalar,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// The process-wide ledger signing identity.
pub struct LedgerCredential {
    key: SigningKey,
    address: Address,
}

impl LedgerCredential {
    /// Parses a hex private key, with or without `0x`.
    pub fn from_hex(input: &str) -> Result<Self, CredentialError> {
        let trimmed = input.trim();
        let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(raw).map_err(|_| CredentialError::NotHex)?;
        if bytes.len() != 32 {
            return Err(CredentialError::WrongLength(bytes.len()));
        }
        let key = SigningKey::from_slice(&bytes).map_err(|_| CredentialError::InvalidScalar)?;
        let address = address_of(&key);
        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign `tx` for `chain_id` and return the raw bytes for
    /// `eth_sendRawTransaction` together with the transaction hash.
    pub fn sign_legacy(&self, tx: &LegacyTx, chain_id: u64) -> Result<SignedTx, CredentialError> {
        let unsigned = UnsignedLegacy {
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            to: tx.to,
            value: tx.value,
            data: tx.data.clone(),
            chain_id,
            empty_r: 0,
            empty_s: 0,
        };
        let sighash = keccak256(alloy_rlp::encode(&unsigned));

        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(sighash.as_slice())
            .map_err(|e| CredentialError::Signing(e.to_string()))?;
        let sig_bytes = signature.to_bytes();

        let signed = SignedLegacy {
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            to: tx.to,
            value: tx.value,
            data: tx.data.clone(),
            v: u64::from(recovery_id.to_byte()) + chain_id * 2 + 35,
            r: U256::from_be_slice(&sig_bytes[..32]),
            s: U256::from_be_slice(&sig_bytes[32..]),
        };
        let raw = alloy_rlp::encode(&signed);
        let hash = keccak256(&raw);

        Ok(SignedTx { raw, hash })
    }
}

impl fmt::Debug for LedgerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerCredential")
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn address_of(key: &SigningKey) -> Address {
    let point = key.verifying_key().to_encoded_point(false);
    // Skip the 0x04 uncompressed tag.
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Fields of a legacy transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

#[derive(RlpEncodable)]
struct UnsignedLegacy {
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: Address,
    value: U256,
    data: Bytes,
    chain_id: u64,
    empty_r: u8,
    empty_s: u8,
}

#[derive(RlpEncodable)]
struct SignedLegacy {
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: Address,
    value: U256,
    data: Bytes,
    v: u64,
    r: U256,
    s: U256,
}

#[derive(Debug, Clone)]
pub struct SignedTx {
    pub raw: Vec<u8>,
    pub hash: TxHash,
}
