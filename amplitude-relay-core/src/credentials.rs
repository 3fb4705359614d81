//! Secure credential storage
//!
//! The relay keeps exactly one secret, the Amplitude API key, under a fixed
//! service name. Stores are accessed with short scoped operations: every
//! call opens, reads or writes one value, and releases the underlying
//! resource before returning, on success and on failure.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// Failure reported by a [`CredentialStore`]
#[derive(Error, Debug)]
pub enum CredentialError {
    /// Nothing stored under the requested name
    #[error("no credential stored for {0}")]
    NotFound(String),

    /// The store itself could not be read or written
    #[error("credential store error: {0}")]
    Store(String),
}

impl From<std::io::Error> for CredentialError {
    fn from(e: std::io::Error) -> Self {
        CredentialError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for CredentialError {
    fn from(e: serde_json::Error) -> Self {
        CredentialError::Store(format!("malformed credential file: {}", e))
    }
}

/// A secure key/value store for secrets.
pub trait CredentialStore: Send + Sync {
    /// Read the secret stored under `name`.
    fn get_credential(&self, name: &str) -> Result<String, CredentialError>;

    /// Replace the secret stored under `name`; `None` removes it.
    fn set_credential(&self, name: &str, value: Option<&str>) -> Result<(), CredentialError>;
}

// ============================================
// File store
// ============================================

/// Credential store backed by a JSON file readable only by its owner.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write never leaves a truncated credential file.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>, CredentialError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &HashMap<String, String>) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let result = (|| -> Result<(), CredentialError> {
            let mut file = open_private(&tmp_path)?;
            file.write_all(serde_json::to_string_pretty(entries)?.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

impl CredentialStore for FileCredentialStore {
    fn get_credential(&self, name: &str) -> Result<String, CredentialError> {
        self.read_all()?
            .remove(name)
            .ok_or_else(|| CredentialError::NotFound(name.to_string()))
    }

    fn set_credential(&self, name: &str, value: Option<&str>) -> Result<(), CredentialError> {
        let mut entries = self.read_all()?;
        match value {
            Some(v) => {
                entries.insert(name.to_string(), v.to_string());
            }
            None => {
                if entries.remove(name).is_none() && !self.path.exists() {
                    return Ok(());
                }
            }
        }
        self.write_all(&entries)?;
        tracing::debug!(
            path = %self.path.display(),
            service = name,
            cleared = value.is_none(),
            "Credential store updated"
        );
        Ok(())
    }
}

// ============================================
// In-memory store
// ============================================

/// In-memory credential store, for embedding and tests.
///
/// Reads and writes can be made to fail to exercise degraded paths.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, String>>,
    fail_reads: bool,
    fail_writes: bool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `value` stored under `name`.
    pub fn with_credential(name: &str, value: &str) -> Self {
        let store = Self::default();
        store
            .lock()
            .insert(name.to_string(), value.to_string());
        store
    }

    /// Every read fails with [`CredentialError::Store`].
    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Every write fails with [`CredentialError::Store`].
    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Peek at the stored value, bypassing failure injection.
    pub fn stored(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panicked writer can't leave a half-written map behind.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get_credential(&self, name: &str) -> Result<String, CredentialError> {
        if self.fail_reads {
            return Err(CredentialError::Store("store unavailable".to_string()));
        }
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(name.to_string()))
    }

    fn set_credential(&self, name: &str, value: Option<&str>) -> Result<(), CredentialError> {
        if self.fail_writes {
            return Err(CredentialError::Store("store is read-only".to_string()));
        }
        let mut entries = self.lock();
        match value {
            Some(v) => entries.insert(name.to_string(), v.to_string()),
            None => entries.remove(name),
        };
        Ok(())
    }
}
