//! Journal Storage Backends
//!
//! File-level abstraction under the journal and snapshot code. The store only
//! ever appends to journal files, reads them whole during recovery, and
//! replaces the snapshot file atomically.
//!
//! ## Implementations
//!
//! - `InMemoryBackend`: unit tests; can simulate a crash by dropping unsynced bytes
//! - `LocalBackend`: a directory on disk (`std::fs::File` + `sync_all`)

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Error type for journal and snapshot file operations
#[derive(Debug)]
pub enum JournalError {
    /// I/O error
    Io(IoError),
    /// Corruption detected (bad magic, CRC mismatch, undecodable payload)
    Corruption(String),
    /// File not found
    NotFound(String),
    /// Fsync failed
    FsyncFailed(String),
    /// Partial write detected
    PartialWrite { expected: usize, actual: usize },
}

impl std::fmt::Display for JournalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalError::Io(e) => write!(f, "journal I/O error: {}", e),
            JournalError::Corruption(msg) => write!(f, "journal corruption: {}", msg),
            JournalError::NotFound(name) => write!(f, "journal file not found: {}", name),
            JournalError::FsyncFailed(msg) => write!(f, "journal fsync failed: {}", msg),
            JournalError::PartialWrite { expected, actual } => write!(
                f,
                "journal partial write: expected {} bytes, wrote {}",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for JournalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JournalError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for JournalError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => JournalError::NotFound(e.to_string()),
            _ => JournalError::Io(e),
        }
    }
}

/// An open journal file, append-only.
pub trait JournalFile: Send {
    /// Append data. Returns the file size after the write.
    fn append(&mut self, data: &[u8]) -> Result<u64, JournalError>;

    /// Flush to durable storage.
    fn sync(&mut self) -> Result<(), JournalError>;

    fn size(&self) -> u64;
}

/// Directory-like container for journal and snapshot files.
pub trait JournalBackend: Send + Sync + 'static {
    /// Create (or truncate) a file for appending.
    fn create(&self, name: &str) -> Result<Box<dyn JournalFile>, JournalError>;

    /// Read a whole file.
    fn read(&self, name: &str) -> Result<Vec<u8>, JournalError>;

    /// All file names, sorted.
    fn list(&self) -> Result<Vec<String>, JournalError>;

    /// Delete a file. Missing files are not an error.
    fn delete(&self, name: &str) -> Result<(), JournalError>;

    fn exists(&self, name: &str) -> Result<bool, JournalError>;

    /// Replace `name` with `data` so readers see either the old or the new
    /// content, never a mix.
    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<(), JournalError>;
}

// ============================================================================
// InMemoryBackend
// ============================================================================

#[derive(Debug, Clone, Default)]
struct InMemoryFile {
    data: Vec<u8>,
    /// Bytes up to here survive a simulated crash
    synced_pos: usize,
}

/// In-memory backend for tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a file (for crash simulation)
    pub fn get_file_data(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|f| f.data.clone())
    }

    /// Overwrite the raw bytes of a file (for crash simulation)
    pub fn set_file_data(&self, name: &str, data: Vec<u8>) {
        if let Some(file) = self.files.lock().get_mut(name) {
            file.synced_pos = file.synced_pos.min(data.len());
            file.data = data;
        }
    }

    /// Simulate a crash: every file loses its unsynced tail.
    pub fn simulate_crash(&self) {
        for file in self.files.lock().values_mut() {
            file.data.truncate(file.synced_pos);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

struct InMemoryJournalFile {
    name: String,
    files: Arc<Mutex<HashMap<String, InMemoryFile>>>,
    current_size: u64,
}

impl JournalFile for InMemoryJournalFile {
    fn append(&mut self, data: &[u8]) -> Result<u64, JournalError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        let mut files = self.files.lock();
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| JournalError::NotFound(self.name.clone()))?;
        file.data.extend_from_slice(data);
        self.current_size = file.data.len() as u64;
        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        if let Some(file) = self.files.lock().get_mut(&self.name) {
            file.synced_pos = file.data.len();
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

impl JournalBackend for InMemoryBackend {
    fn create(&self, name: &str) -> Result<Box<dyn JournalFile>, JournalError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        self.files
            .lock()
            .insert(name.to_string(), InMemoryFile::default());
        Ok(Box::new(InMemoryJournalFile {
            name: name.to_string(),
            files: Arc::clone(&self.files),
            current_size: 0,
        }))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, JournalError> {
        self.files
            .lock()
            .get(name)
            .map(|f| f.data.clone())
            .ok_or_else(|| JournalError::NotFound(name.to_string()))
    }

    fn list(&self) -> Result<Vec<String>, JournalError> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), JournalError> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool, JournalError> {
        Ok(self.files.lock().contains_key(name))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<(), JournalError> {
        self.files.lock().insert(
            name.to_string(),
            InMemoryFile {
                data: data.to_vec(),
                synced_pos: data.len(),
            },
        );
        Ok(())
    }
}

// ============================================================================
// LocalBackend
// ============================================================================

/// Directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalBackend {
    dir: PathBuf,
}

impl LocalBackend {
    /// Open a directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(LocalBackend { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

struct LocalJournalFile {
    file: std::fs::File,
    current_size: u64,
}

impl JournalFile for LocalJournalFile {
    fn append(&mut self, data: &[u8]) -> Result<u64, JournalError> {
        debug_assert!(!data.is_empty(), "Precondition: data must not be empty");

        let written = self.file.write(data).map_err(JournalError::Io)?;
        if written != data.len() {
            return Err(JournalError::PartialWrite {
                expected: data.len(),
                actual: written,
            });
        }
        self.current_size = self.current_size.saturating_add(written as u64);
        Ok(self.current_size)
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        self.file
            .sync_all()
            .map_err(|e| JournalError::FsyncFailed(e.to_string()))
    }

    fn size(&self) -> u64 {
        self.current_size
    }
}

impl JournalBackend for LocalBackend {
    fn create(&self, name: &str) -> Result<Box<dyn JournalFile>, JournalError> {
        debug_assert!(!name.is_empty(), "Precondition: name must not be empty");

        let file = std::fs::File::create(self.file_path(name)).map_err(JournalError::Io)?;
        Ok(Box::new(LocalJournalFile {
            file,
            current_size: 0,
        }))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, JournalError> {
        let path = self.file_path(name);
        if !path.exists() {
            return Err(JournalError::NotFound(name.to_string()));
        }
        std::fs::read(&path).map_err(JournalError::Io)
    }

    fn list(&self) -> Result<Vec<String>, JournalError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(JournalError::Io)? {
            let entry = entry.map_err(JournalError::Io)?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self, name: &str) -> Result<(), JournalError> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JournalError::Io(e)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool, JournalError> {
        Ok(self.file_path(name).exists())
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<(), JournalError> {
        let tmp = self.file_path(&format!("{}.tmp", name));
        {
            let mut file = std::fs::File::create(&tmp).map_err(JournalError::Io)?;
            file.write_all(data).map_err(JournalError::Io)?;
            file.sync_all()
                .map_err(|e| JournalError::FsyncFailed(e.to_string()))?;
        }
        std::fs::rename(&tmp, self.file_path(name)).map_err(JournalError::Io)?;
        // Persist the rename itself; not every platform can open a directory.
        if let Ok(dir) = std::fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}
