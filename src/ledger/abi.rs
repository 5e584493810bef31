//! Contract ABI codec
//!
//! Only the two functions of the evidence contract are encoded:
//!
//! ```text
//! storeEvidence(string caseId, string fileHash)          nonpayable
//! getEvidence(string caseId) view returns (string, uint256)
//! ```

use alloy_primitives::keccak256;

use super::LedgerError;

const WORD: usize = 32;

pub const STORE_EVIDENCE_SIG: &str = "storeEvidence(string,string)";
pub const GET_EVIDENCE_SIG: &str = "getEvidence(string)";

/// First four bytes of the keccak-256 of a canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn word_from_usize(value: usize) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&(value as u64).to_be_bytes());
    word
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

/// Length word followed by the bytes, right-padded to a word boundary.
fn encode_string_tail(value: &str, out: &mut Vec<u8>) {
    let bytes = value.as_bytes();
    out.extend_from_slice(&word_from_usize(bytes.len()));
    out.extend_from_slice(bytes);
    out.resize(out.len() + padded_len(bytes.len()) - bytes.len(), 0);
}

/// Encode a call whose arguments are all `string`.
fn encode_strings_call(signature: &str, args: &[&str]) -> Vec<u8> {
    let head_len = args.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for arg in args {
        head.extend_from_slice(&word_from_usize(head_len + tail.len()));
        encode_string_tail(arg, &mut tail);
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

pub fn encode_store_evidence(case_id: &str, file_hash: &str) -> Vec<u8> {
    encode_strings_call(STORE_EVIDENCE_SIG, &[case_id, file_hash])
}

pub fn encode_get_evidence(case_id: &str) -> Vec<u8> {
    encode_strings_call(GET_EVIDENCE_SIG, &[case_id])
}

fn read_word(data: &[u8], offset: usize) -> Result<&[u8], LedgerError> {
    offset
        .checked_add(WORD)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| LedgerError::Decode(format!("return data truncated at byte {}", offset)))
}

/// Reads a word as an unsigned integer that must fit in `u64`.
fn read_u64(data: &[u8], offset: usize) -> Result<u64, LedgerError> {
    let word = read_word(data, offset)?;
    if word[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(LedgerError::Decode(format!("integer at byte {} exceeds 64 bits", offset)));
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[WORD - 8..]);
    Ok(u64::from_be_bytes(tail))
}

fn read_usize(data: &[u8], offset: usize) -> Result<usize, LedgerError> {
    let value = read_u64(data, offset)?;
    usize::try_from(value).map_err(|_| LedgerError::Decode(format!("offset {} out of range", value)))
}

/// Decode the `(string, uint256)` returned by `getEvidence`.
pub fn decode_get_evidence(data: &[u8]) -> Result<(String, u64), LedgerError> {
    let str_offset = read_usize(data, 0)?;
    let timestamp = read_u64(data, WORD)?;

    let len = read_usize(data, str_offset)?;
    let bytes = str_offset
        .checked_add(WORD)
        .and_then(|start| Some(start..start.checked_add(len)?))
        .and_then(|range| data.get(range))
        .ok_or_else(|| LedgerError::Decode("string payload truncated".into()))?;
    let value = String::from_utf8(bytes.to_vec())
        .map_err(|e| LedgerError::Decode(format!("stored hash is not UTF-8: {}", e)))?;

    Ok((value, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Contract-shaped `(string, uint256)` return data.
    fn encode_get_evidence_return(stored_hash: &str, timestamp: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&word_from_usize(2 * WORD));
        let mut ts = [0u8; WORD];
        ts[WORD - 8..].copy_from_slice(&timestamp.to_be_bytes());
        out.extend_from_slice(&ts);
        encode_string_tail(stored_hash, &mut out);
        out
    }

    #[test]
    fn test_selector_is_keccak_prefix() {
        let full = keccak256(STORE_EVIDENCE_SIG.as_bytes());
        assert_eq!(selector(STORE_EVIDENCE_SIG), full[..4]);
        assert_ne!(selector(STORE_EVIDENCE_SIG), selector(GET_EVIDENCE_SIG));
        // Well-known ERC-20 selector as a sanity vector.
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_store_evidence_layout() {
        let hash = "a".repeat(64);
        let data = encode_store_evidence("CASE-1/ev", &hash);
        let body = &data[4..];

        assert_eq!(data[..4], selector(STORE_EVIDENCE_SIG));
        // Two head words, then tail for arg 0 (len word + one padded word),
        // then tail for arg 1 (len word + two words).
        assert_eq!(body.len(), 2 * 32 + (32 + 32) + (32 + 64));
        assert_eq!(read_u64(body, 0).unwrap(), 64);
        assert_eq!(read_u64(body, 32).unwrap(), 128);
        assert_eq!(read_u64(body, 64).unwrap(), 9);
        assert_eq!(&body[96..105], b"CASE-1/ev");
        assert!(body[105..128].iter().all(|b| *b == 0));
        assert_eq!(read_u64(body, 128).unwrap(), 64);
        assert_eq!(&body[160..224], hash.as_bytes());
    }

    #[test]
    fn test_get_evidence_layout() {
        let data = encode_get_evidence("C");
        assert_eq!(data.len(), 4 + 32 * 3);
        assert_eq!(read_u64(&data[4..], 0).unwrap(), 32);
        assert_eq!(read_u64(&data[4..], 32).unwrap(), 1);
        assert_eq!(data[4 + 64], b'C');
    }

    #[test]
    fn test_empty_string_arg() {
        let data = encode_get_evidence("");
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(read_u64(&data[4..], 32).unwrap(), 0);
    }

    #[test]
    fn test_decode_return() {
        let hash = "0f".repeat(32);
        let encoded = encode_get_evidence_return(&hash, 1_717_171_717);
        let (stored, ts) = decode_get_evidence(&encoded).unwrap();
        assert_eq!(stored, hash);
        assert_eq!(ts, 1_717_171_717);

        let (empty, zero) = decode_get_evidence(&encode_get_evidence_return("", 0)).unwrap();
        assert!(empty.is_empty());
        assert_eq!(zero, 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_get_evidence(&[]).is_err());
        assert!(decode_get_evidence(&[0u8; 40]).is_err());

        let mut encoded = encode_get_evidence_return("abc", 5);
        encoded.truncate(encoded.len() - 32);
        assert!(decode_get_evidence(&encoded).is_err());

        let mut huge_ts = encode_get_evidence_return("abc", 5);
        huge_ts[32] = 1;
        assert!(decode_get_evidence(&huge_ts).is_err());
    }

    #[test]
    fn test_decode_rejects_overflowing_offsets() {
        let mut data = vec![0u8; 64];
        data[24..32].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(decode_get_evidence(&data), Err(LedgerError::Decode(_))));

        // Valid offset, but a length word that would overflow the end index.
        let mut data = encode_get_evidence_return("abc", 5);
        data[64 + 24..64 + 32].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(decode_get_evidence(&data), Err(LedgerError::Decode(_))));
    }
}
