use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::util::{duration_to_millis, lock_unpoisoned};

pub type Metadata = BTreeMap<String, String>;

pub mod metadata_key {
    pub const MIME_TYPE: &str = "MimeType";
    /// Rendered as an HTTP date.
    pub const DOWNLOAD_TIMESTAMP: &str = "DownloadTimestamp";
    pub const REMOTE_PATH: &str = "RemotePath";
    /// Pixel dimensions, written once a cached image has been decoded.
    pub const IMAGE_WIDTH: &str = "ImageWidth";
    pub const IMAGE_HEIGHT: &str = "ImageHeight";
}

pub const DEFAULT_CONTENT_EXPIRATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Byte store consumed by [`crate::RemoteData`].
///
/// Implementations must be safe for concurrent use by key. Entries older than
/// [`DataCache::content_expiration`] are treated as absent.
pub trait DataCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Bytes>;

    fn set(&self, key: &str, data: Bytes);

    fn metadata(&self, key: &str) -> Option<Metadata>;

    fn set_metadata(&self, key: &str, metadata: Metadata);

    fn remove(&self, key: &str);

    fn clear(&self);

    fn content_expiration(&self) -> Duration;

    fn set_content_expiration(&self, expiration: Duration);

    fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

#[derive(Debug)]
struct MemoryEntry {
    data: Option<Bytes>,
    metadata: Option<Metadata>,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct MemoryDataCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    expiration_ms: AtomicU64,
}

impl Default for MemoryDataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataCache {
    pub fn new() -> Self {
        Self::with_expiration(DEFAULT_CONTENT_EXPIRATION)
    }

    pub fn with_expiration(expiration: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiration_ms: AtomicU64::new(duration_to_millis(expiration)),
        }
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries)
            .values()
            .filter(|entry| entry.data.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &MemoryEntry) -> bool {
        entry.stored_at.elapsed() >= self.content_expiration()
    }
}

impl DataCache for MemoryDataCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.get(key)?;
        if self.is_expired(entry) {
            entries.remove(key);
            return None;
        }
        entry.data.clone()
    }

    fn set(&self, key: &str, data: Bytes) {
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.entry(key.to_owned()).or_insert_with(|| MemoryEntry {
            data: None,
            metadata: None,
            stored_at: Instant::now(),
        });
        entry.data = Some(data);
        entry.stored_at = Instant::now();
    }

    fn metadata(&self, key: &str) -> Option<Metadata> {
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.get(key)?;
        if self.is_expired(entry) {
            entries.remove(key);
            return None;
        }
        entry.metadata.clone()
    }

    fn set_metadata(&self, key: &str, metadata: Metadata) {
        let mut entries = lock_unpoisoned(&self.entries);
        entries
            .entry(key.to_owned())
            .or_insert_with(|| MemoryEntry {
                data: None,
                metadata: None,
                stored_at: Instant::now(),
            })
            .metadata = Some(metadata);
    }

    fn remove(&self, key: &str) {
        lock_unpoisoned(&self.entries).remove(key);
    }

    fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    fn content_expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms.load(Ordering::Relaxed))
    }

    fn set_content_expiration(&self, expiration: Duration) {
        self.expiration_ms
            .store(duration_to_millis(expiration), Ordering::Relaxed);
    }
}

/// Stores each entry as a file named by the SHA-256 of its key, with metadata in a JSON side file.
///
/// IO failures are logged and treated as cache misses.
#[derive(Debug)]
pub struct DiskDataCache {
    root: PathBuf,
    expiration_ms: AtomicU64,
}

const METADATA_SUFFIX: &str = ".meta.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Expired,
    Missing,
}

impl DiskDataCache {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        Self::with_expiration(root, DEFAULT_CONTENT_EXPIRATION)
    }

    pub fn with_expiration(root: impl Into<PathBuf>, expiration: Duration) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            expiration_ms: AtomicU64::new(duration_to_millis(expiration)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        let mut file_name = hex::encode(Sha256::digest(key.as_bytes()));
        file_name.push_str(METADATA_SUFFIX);
        self.root.join(file_name)
    }

    fn freshness(&self, path: &Path) -> Freshness {
        let modified = match std::fs::metadata(path).and_then(|metadata| metadata.modified()) {
            Ok(modified) => modified,
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %error, "failed to stat cache entry");
                }
                return Freshness::Missing;
            }
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age < self.content_expiration() {
            Freshness::Fresh
        } else {
            Freshness::Expired
        }
    }

    /// Readers see either the previous file or the complete new one.
    fn write_file(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        let mut staged = tempfile::NamedTempFile::new_in(&self.root)?;
        staged.write_all(contents)?;
        staged.persist(path).map_err(|error| error.error)?;
        Ok(())
    }

    fn remove_file(path: &Path) {
        if let Err(error) = std::fs::remove_file(path) {
            if error.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), error = %error, "failed to remove cache file");
            }
        }
    }
}

impl DataCache for DiskDataCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let path = self.data_path(key);
        match self.freshness(&path) {
            Freshness::Fresh => {}
            Freshness::Expired => {
                self.remove(key);
                return None;
            }
            Freshness::Missing => return None,
        }
        match std::fs::read(&path) {
            Ok(data) => Some(Bytes::from(data)),
            Err(error) => {
                if error.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %error, "failed to read cache entry");
                }
                None
            }
        }
    }

    fn set(&self, key: &str, data: Bytes) {
        let path = self.data_path(key);
        if let Err(error) = self.write_file(&path, &data) {
            warn!(path = %path.display(), error = %error, "failed to write cache entry");
        }
    }

    fn metadata(&self, key: &str) -> Option<Metadata> {
        let path = self.metadata_path(key);
        if self.freshness(&path) != Freshness::Fresh {
            return None;
        }
        let raw = std::fs::read(&path)
            .map_err(|error| {
                warn!(path = %path.display(), error = %error, "failed to read cache metadata");
            })
            .ok()?;
        serde_json::from_slice(&raw)
            .map_err(|error| {
                warn!(path = %path.display(), error = %error, "cache metadata is malformed");
            })
            .ok()
    }

    fn set_metadata(&self, key: &str, metadata: Metadata) {
        let path = self.metadata_path(key);
        let encoded = match serde_json::to_vec(&metadata) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(error = %error, "failed to encode cache metadata");
                return;
            }
        };
        if let Err(error) = self.write_file(&path, &encoded) {
            warn!(path = %path.display(), error = %error, "failed to write cache metadata");
        }
    }

    fn remove(&self, key: &str) {
        Self::remove_file(&self.data_path(key));
        Self::remove_file(&self.metadata_path(key));
    }

    fn clear(&self) {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(root = %self.root.display(), error = %error, "failed to list cache directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                Self::remove_file(&path);
            }
        }
    }

    fn content_expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms.load(Ordering::Relaxed))
    }

    fn set_content_expiration(&self, expiration: Duration) {
        self.expiration_ms
            .store(duration_to_millis(expiration), Ordering::Relaxed);
    }
}
