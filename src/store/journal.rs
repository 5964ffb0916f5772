//! Write-Ahead Journal - Entry Format, Writer, Reader, Rotator
//!
//! Every committed update transaction is appended as one entry holding its
//! serialized overlay, and synced before the commit becomes visible.
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ Header (16 bytes)                │
//! │ - magic: "FRJL" (4 bytes)        │
//! │ - version: u8                    │
//! │ - flags: u8                      │
//! │ - reserved: 2 bytes              │
//! │ - sequence: u64 LE               │
//! ├──────────────────────────────────┤
//! │ Entry 0                          │
//! │ - data_length: u32 LE            │
//! │ - txid: u64 LE                   │
//! │ - checksum: u32 LE (CRC32)       │
//! │ - data: [u8; data_length]        │
//! ├──────────────────────────────────┤
//! │ Entry 1 ...                      │
//! └──────────────────────────────────┘
//! ```
//!
//! The reader stops at the first corrupted or truncated entry, recovering
//! every transaction fully written before a crash.

use super::backend::{JournalBackend, JournalError, JournalFile};
use super::node::Pending;
use std::sync::Arc;

/// Journal file magic number
pub const JOURNAL_MAGIC: [u8; 4] = *b"FRJL";
/// Current journal format version
pub const JOURNAL_VERSION: u8 = 1;
/// Header size in bytes
pub const JOURNAL_HEADER_SIZE: usize = 16;
/// Entry overhead: data_length(4) + txid(8) + checksum(4)
pub const JOURNAL_ENTRY_OVERHEAD: usize = 16;

/// One committed transaction
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub data: Vec<u8>,
    pub txid: u64,
    pub checksum: u32,
}

impl JournalEntry {
    pub fn from_pending(pending: &Pending, txid: u64) -> Result<Self, JournalError> {
        let data = bincode::serialize(pending)
            .map_err(|e| JournalError::Corruption(format!("serialize: {}", e)))?;
        let checksum = crc32fast::hash(&data);

        debug_assert!(!data.is_empty(), "Postcondition: serialized data must not be empty");

        Ok(JournalEntry {
            data,
            txid,
            checksum,
        })
    }

    pub fn to_pending(&self) -> Result<Pending, JournalError> {
        bincode::deserialize(&self.data)
            .map_err(|e| JournalError::Corruption(format!("deserialize: {}", e)))
    }

    pub fn validate(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    pub fn encode(&self) -> Vec<u8> {
        let total_size = JOURNAL_ENTRY_OVERHEAD + self.data.len();
        let mut buf = Vec::with_capacity(total_size);

        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.txid.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&self.data);

        debug_assert_eq!(
            buf.len(),
            total_size,
            "Postcondition: encoded size must match expected"
        );
        buf
    }

    /// Decode one entry. `None` if truncated or corrupt.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < JOURNAL_ENTRY_OVERHEAD {
            return None;
        }

        let data_len = u32::from_le_bytes(data[0..4].try_into().ok()?) as usize;
        let txid = u64::from_le_bytes(data[4..12].try_into().ok()?);
        let checksum = u32::from_le_bytes(data[12..16].try_into().ok()?);

        let total_size = JOURNAL_ENTRY_OVERHEAD.checked_add(data_len)?;
        if data.len() < total_size {
            return None;
        }

        let entry_data = data[JOURNAL_ENTRY_OVERHEAD..total_size].to_vec();
        if crc32fast::hash(&entry_data) != checksum {
            return None;
        }

        Some((
            JournalEntry {
                data: entry_data,
                txid,
                checksum,
            },
            total_size,
        ))
    }
}

// ============================================================================
// Writer / Reader
// ============================================================================

/// Writes the header, then entries, to one journal file
pub struct JournalWriter {
    file: Box<dyn JournalFile>,
    sequence: u64,
    entry_count: u64,
    max_txid: u64,
}

impl JournalWriter {
    pub fn new(mut file: Box<dyn JournalFile>, sequence: u64) -> Result<Self, JournalError> {
        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        header[0..4].copy_from_slice(&JOURNAL_MAGIC);
        header[4] = JOURNAL_VERSION;
        header[8..16].copy_from_slice(&sequence.to_le_bytes());
        file.append(&header)?;

        Ok(JournalWriter {
            file,
            sequence,
            entry_count: 0,
            max_txid: 0,
        })
    }

    /// Append without syncing.
    pub fn append_entry(&mut self, entry: &JournalEntry) -> Result<u64, JournalError> {
        debug_assert!(entry.validate(), "Precondition: entry checksum must be valid");
        debug_assert!(
            entry.txid > self.max_txid,
            "Precondition: txids must increase within a file"
        );

        let offset = self.file.append(&entry.encode())?;
        self.entry_count += 1;
        self.max_txid = entry.txid;
        Ok(offset)
    }

    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.file.sync()
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Reads the entries of one journal file
pub struct JournalReader {
    data: Vec<u8>,
    sequence: u64,
}

impl JournalReader {
    /// Validates the header.
    pub fn open(data: Vec<u8>) -> Result<Self, JournalError> {
        if data.len() < JOURNAL_HEADER_SIZE {
            return Err(JournalError::Corruption(
                "journal file too short for header".to_string(),
            ));
        }
        if data[0..4] != JOURNAL_MAGIC {
            return Err(JournalError::Corruption(format!(
                "invalid journal magic: {:?}",
                &data[0..4]
            )));
        }
        if data[4] != JOURNAL_VERSION {
            return Err(JournalError::Corruption(format!(
                "unsupported journal version: {}",
                data[4]
            )));
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&data[8..16]);

        Ok(JournalReader {
            data,
            sequence: u64::from_le_bytes(seq),
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Entries up to the first corrupt or truncated one.
    pub fn entries(&self) -> Vec<JournalEntry> {
        let mut entries = Vec::new();
        let mut offset = JOURNAL_HEADER_SIZE;

        while offset < self.data.len() {
            match JournalEntry::decode(&self.data[offset..]) {
                Some((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                None => break,
            }
        }
        entries
    }
}

// ============================================================================
// Rotator
// ============================================================================

/// Journal file naming: journal-{sequence:08x}.log
fn journal_file_name(sequence: u64) -> String {
    format!("journal-{:08x}.log", sequence)
}

fn parse_journal_sequence(name: &str) -> Option<u64> {
    let name = name.strip_prefix("journal-")?.strip_suffix(".log")?;
    u64::from_str_radix(name, 16).ok()
}

/// Manages the set of journal files: appends, rotation and truncation
pub struct JournalRotator {
    backend: Arc<dyn JournalBackend>,
    max_file_size: usize,
    current_writer: Option<JournalWriter>,
    current_sequence: u64,
}

impl JournalRotator {
    /// Scans existing files to pick the next file sequence.
    pub fn new(backend: Arc<dyn JournalBackend>, max_file_size: usize) -> Result<Self, JournalError> {
        debug_assert!(
            max_file_size > JOURNAL_HEADER_SIZE,
            "Precondition: max_file_size must be larger than header"
        );

        let current_sequence = backend
            .list()?
            .iter()
            .filter_map(|name| parse_journal_sequence(name))
            .max()
            .unwrap_or(0);

        Ok(JournalRotator {
            backend,
            max_file_size,
            current_writer: None,
            current_sequence,
        })
    }

    /// Append an entry, rotating first if the current file is full.
    /// A failed write abandons the current file so the next append starts clean.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<u64, JournalError> {
        let needs_new_file = match &self.current_writer {
            None => true,
            Some(writer) => writer.size() as usize >= self.max_file_size,
        };
        if needs_new_file {
            self.rotate()?;
        }

        let Some(writer) = self.current_writer.as_mut() else {
            return Err(JournalError::NotFound(journal_file_name(self.current_sequence)));
        };
        match writer.append_entry(entry) {
            Ok(_) => Ok(writer.sequence()),
            Err(e) => {
                self.current_writer = None;
                Err(e)
            }
        }
    }

    pub fn sync(&mut self) -> Result<(), JournalError> {
        if let Some(writer) = self.current_writer.as_mut() {
            if let Err(e) = writer.sync() {
                self.current_writer = None;
                return Err(e);
            }
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.current_writer = None;
        self.current_sequence += 1;
        let file = self.backend.create(&journal_file_name(self.current_sequence))?;
        self.current_writer = Some(JournalWriter::new(file, self.current_sequence)?);
        Ok(())
    }

    /// Every readable entry, in file order. Unreadable files are skipped.
    pub fn recover_all_entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let mut files: Vec<(u64, String)> = self
            .backend
            .list()?
            .into_iter()
            .filter_map(|name| Some((parse_journal_sequence(&name)?, name)))
            .collect();
        files.sort_by_key(|(seq, _)| *seq);

        let mut all = Vec::new();
        for (_, name) in files {
            let Ok(data) = self.backend.read(&name) else {
                continue;
            };
            let Ok(reader) = JournalReader::open(data) else {
                continue;
            };
            all.extend(reader.entries());
        }
        Ok(all)
    }

    /// Overlays of transactions with txid strictly greater than `after`.
    pub fn recover_after(&self, after: u64) -> Result<Vec<(u64, Pending)>, JournalError> {
        self.recover_all_entries()?
            .into_iter()
            .filter(|e| e.txid > after)
            .map(|e| Ok((e.txid, e.to_pending()?)))
            .collect()
    }

    /// Close the current file and delete every file whose entries are all at
    /// or before `through_txid`. Returns the number of files deleted.
    pub fn truncate_through(&mut self, through_txid: u64) -> Result<usize, JournalError> {
        self.current_writer = None;

        let mut deleted = 0;
        for name in self.backend.list()? {
            if parse_journal_sequence(&name).is_none() {
                continue;
            }
            let max_txid = match self.backend.read(&name).and_then(JournalReader::open) {
                Ok(reader) => reader.entries().iter().map(|e| e.txid).max().unwrap_or(0),
                // Covered by the snapshot or unreadable anyway
                Err(_) => 0,
            };
            if max_txid <= through_txid {
                self.backend.delete(&name)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn current_sequence(&self) -> u64 {
        self.current_sequence
    }
}
