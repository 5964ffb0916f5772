//! Snapshot File
//!
//! A full copy of the committed bucket tree, written at checkpoints so the
//! journal can be truncated. Recovery loads the snapshot, then replays
//! journal entries newer than the snapshot's txid.
//!
//! ```text
//! ┌───────────────────────────────────┐
//! │ Header (32 bytes)                 │
//! │ - magic: "FRSN" (4 bytes)         │
//! │ - version: u8                     │
//! │ - flags: u8 (reserved)            │
//! │ - padding: 2 bytes                │
//! │ - txid: u64 LE                    │
//! │ - data_length: u64 LE             │
//! │ - reserved: 4 bytes               │
//! │ - checksum: u32 LE (header+data)  │
//! ├───────────────────────────────────┤
//! │ data: bincode(Node)               │
//! └───────────────────────────────────┘
//! ```

use super::backend::JournalError;
use super::node::Node;

/// Snapshot file name within the store directory
pub const SNAPSHOT_FILE: &str = "snapshot.db";

const SNAPSHOT_MAGIC: &[u8; 4] = b"FRSN";
const SNAPSHOT_VERSION: u8 = 1;
const SNAPSHOT_HEADER_SIZE: usize = 32;

fn checksum(header: &[u8], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..28]);
    hasher.update(data);
    hasher.finalize()
}

/// Serialize a tree as of `txid`.
pub fn encode_snapshot(root: &Node, txid: u64) -> Result<Vec<u8>, JournalError> {
    let data = bincode::serialize(root)
        .map_err(|e| JournalError::Corruption(format!("serialize snapshot: {}", e)))?;

    let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + data.len());
    buf.extend_from_slice(SNAPSHOT_MAGIC);
    buf.push(SNAPSHOT_VERSION);
    buf.push(0);
    buf.extend_from_slice(&[0u8; 2]);
    buf.extend_from_slice(&txid.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    let sum = checksum(&buf, &data);
    buf.extend_from_slice(&sum.to_le_bytes());

    debug_assert_eq!(
        buf.len(),
        SNAPSHOT_HEADER_SIZE,
        "Postcondition: header must be exactly SNAPSHOT_HEADER_SIZE"
    );

    buf.extend_from_slice(&data);
    Ok(buf)
}

/// Parse a snapshot file, returning the tree and its txid.
pub fn decode_snapshot(bytes: &[u8]) -> Result<(Node, u64), JournalError> {
    if bytes.len() < SNAPSHOT_HEADER_SIZE {
        return Err(JournalError::Corruption("snapshot too short".to_string()));
    }
    let (header, data) = bytes.split_at(SNAPSHOT_HEADER_SIZE);
    if &header[0..4] != SNAPSHOT_MAGIC {
        return Err(JournalError::Corruption(format!(
            "invalid snapshot magic: {:?}",
            &header[0..4]
        )));
    }
    if header[4] != SNAPSHOT_VERSION {
        return Err(JournalError::Corruption(format!(
            "unsupported snapshot version: {}",
            header[4]
        )));
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&header[8..16]);
    let txid = u64::from_le_bytes(word);
    word.copy_from_slice(&header[16..24]);
    let data_len = u64::from_le_bytes(word) as usize;
    let mut sum = [0u8; 4];
    sum.copy_from_slice(&header[28..32]);
    let expected = u32::from_le_bytes(sum);

    if data.len() != data_len {
        return Err(JournalError::Corruption(format!(
            "snapshot length mismatch: header says {}, found {}",
            data_len,
            data.len()
        )));
    }
    let actual = checksum(header, data);
    if actual != expected {
        return Err(JournalError::Corruption(format!(
            "snapshot checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    let root = bincode::deserialize(data)
        .map_err(|e| JournalError::Corruption(format!("deserialize snapshot: {}", e)))?;
    Ok((root, txid))
}
