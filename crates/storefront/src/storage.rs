//! Local persistence for guest state.
//!
//! The adapter is synchronous and small: one JSON blob per guest key. It never
//! fails silently; quota and I/O failures come back as [`StorageError`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::config::StorageConfig;

/// Guest cart blob.
pub const GUEST_CART_KEY: &str = "guest_cart_v1";
/// Guest wishlist blob.
pub const GUEST_WISHLIST_KEY: &str = "guest_wishlist_v1";
/// Guest coupon blob.
pub const GUEST_COUPON_KEY: &str = "guest_coupon_v1";

/// Errors from a local storage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("I/O error on {key}: {message}")]
    Io { key: String, message: String },

    #[error("Storage quota exceeded: need {needed} bytes, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("Failed to encode {key}: {message}")]
    Encode { key: String, message: String },
}

/// Keyed blob storage on the device.
pub trait LocalStorage: Send + Sync + Debug {
    /// Read the blob under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the underlying medium cannot be read.
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace the blob under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::QuotaExceeded` if the write would exceed the
    /// adapter's quota, or `StorageError::Io` on medium failure.
    fn write(&self, key: &str, blob: &str) -> Result<(), StorageError>;

    /// Remove the blob under `key`. Erasing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` on medium failure.
    fn erase(&self, key: &str) -> Result<(), StorageError>;
}

/// Read and decode a JSON blob. A blob that fails to decode reads as absent.
///
/// # Errors
///
/// Propagates adapter read failures.
pub fn read_json<T: DeserializeOwned>(
    storage: &dyn LocalStorage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    let Some(blob) = storage.read(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&blob) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(key, error = %e, "Discarding corrupt guest blob");
            Ok(None)
        }
    }
}

/// Encode `value` as JSON and write it under `key`.
///
/// # Errors
///
/// Returns `StorageError::Encode` if serialization fails, otherwise
/// propagates adapter write failures.
pub fn write_json<T: Serialize + ?Sized>(
    storage: &dyn LocalStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let blob = serde_json::to_string(value).map_err(|e| StorageError::Encode {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    storage.write(key, &blob)
}

/// Build the adapter selected by configuration.
///
/// # Errors
///
/// Returns `StorageError::Io` if the storage directory cannot be created.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn LocalStorage>, StorageError> {
    Ok(match &config.dir {
        Some(dir) => Arc::new(FileStorage::open(dir, config.quota_bytes)?),
        None => Arc::new(MemoryStorage::with_quota(config.quota_bytes)),
    })
}

// =============================================================================
// In-memory adapter
// =============================================================================

/// Quota-aware in-memory storage.
#[derive(Debug)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, String>>,
    quota: usize,
}

impl MemoryStorage {
    /// Storage with no practical quota.
    #[must_use]
    pub fn new() -> Self {
        Self::with_quota(usize::MAX)
    }

    #[must_use]
    pub fn with_quota(quota: usize) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            quota,
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(key).cloned())
    }

    fn write(&self, key: &str, blob: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        let others: usize = blobs
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        let needed = others.saturating_add(key.len() + blob.len());
        if needed > self.quota {
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }
        blobs.insert(key.to_string(), blob.to_string());
        Ok(())
    }

    fn erase(&self, key: &str) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.remove(key);
        Ok(())
    }
}

// =============================================================================
// File adapter
// =============================================================================

/// One file per key under a directory.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    quota: usize,
}

impl FileStorage {
    /// Open (and create if needed) the storage directory.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, quota: usize) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir.display().to_string(), &e))?;
        Ok(Self { dir, quota })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }

    fn usage_excluding(&self, target: &Path) -> Result<usize, StorageError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| io_error(&self.dir.display().to_string(), &e))?;
        let mut total = 0usize;
        for entry in entries.flatten() {
            if entry.path() == target {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                total = total.saturating_add(usize::try_from(meta.len()).unwrap_or(usize::MAX));
            }
        }
        Ok(total)
    }
}

impl LocalStorage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(key, &e)),
        }
    }

    fn write(&self, key: &str, blob: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let needed = self.usage_excluding(&path)?.saturating_add(blob.len());
        if needed > self.quota {
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota,
            });
        }

        // Write-then-rename so a crash never leaves a torn blob
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, blob).map_err(|e| io_error(key, &e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_error(key, &e))
    }

    fn erase(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, &e)),
        }
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn io_error(key: &str, err: &std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        message: err.to_string(),
    }
}
