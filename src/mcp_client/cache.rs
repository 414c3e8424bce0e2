//! Discovery cache — persisted `tools/list` results per server.
//!
//! Lets a host register tools at startup before any server is connected.
//! Cached records are provisional: a live discovery always supersedes them.
//! Each record carries a fingerprint of the transport recipe it came from,
//! so a record written for an old configuration is ignored.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::errors::McpError;
use super::types::{McpToolDefinition, ServerDescriptor};

/// Current on-disk format version.
const CACHE_VERSION: u32 = 1;

const CACHE_FILE_NAME: &str = "discovery.json";

// ─── Record ──────────────────────────────────────────────────────────────────

/// Tools discovered for one server at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerToolsRecord {
    /// SHA-256 of the transport recipe the tools were discovered with.
    pub fingerprint: String,
    pub discovered_at: DateTime<Utc>,
    pub tools: Vec<McpToolDefinition>,
}

impl ServerToolsRecord {
    /// Snapshot a live discovery result for persistence.
    pub fn from_tools(descriptor: &ServerDescriptor, tools: &[McpToolDefinition]) -> Self {
        Self {
            fingerprint: fingerprint(descriptor),
            discovered_at: Utc::now(),
            tools: tools.to_vec(),
        }
    }

    /// Whether this record was produced from the same transport recipe.
    pub fn matches(&self, descriptor: &ServerDescriptor) -> bool {
        self.fingerprint == fingerprint(descriptor)
    }
}

/// Stable hash of a descriptor's transport recipe.
pub fn fingerprint(descriptor: &ServerDescriptor) -> String {
    // BTreeMap-backed fields serialize in a fixed order.
    let recipe = serde_json::to_vec(&descriptor.transport).unwrap_or_default();
    format!("{:x}", Sha256::digest(&recipe))
}

// ─── Cache Trait ─────────────────────────────────────────────────────────────

/// Key-value store for discovery results, keyed by server identity.
pub trait DiscoveryCache: Send + Sync {
    fn load(&self, server: &str) -> Result<Option<ServerToolsRecord>, McpError>;
    fn store(&self, server: &str, record: ServerToolsRecord) -> Result<(), McpError>;
}

// ─── JSON File Cache ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCache {
    version: u32,
    servers: BTreeMap<String, ServerToolsRecord>,
}

/// All servers in one JSON file, rewritten atomically on every store.
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `<platform cache dir>/toolmux/discovery.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("toolmux").join(CACHE_FILE_NAME))
    }

    pub fn open_default() -> Result<Self, McpError> {
        Self::default_path()
            .map(Self::new)
            .ok_or_else(|| McpError::CacheError {
                reason: "could not resolve a platform cache directory".into(),
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file. A missing file is an empty cache; an unreadable
    /// or outdated one is logged and treated as empty.
    fn read_all(&self) -> Result<PersistedCache, McpError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedCache::default());
            }
            Err(e) => {
                return Err(McpError::CacheError {
                    reason: format!("failed to read {}: {e}", self.path.display()),
                });
            }
        };

        match serde_json::from_str::<PersistedCache>(&content) {
            Ok(cache) if cache.version == CACHE_VERSION => Ok(cache),
            Ok(cache) => {
                tracing::warn!(
                    path = %self.path.display(),
                    version = cache.version,
                    "ignoring discovery cache with unknown version"
                );
                Ok(PersistedCache::default())
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "ignoring unreadable discovery cache"
                );
                Ok(PersistedCache::default())
            }
        }
    }

    fn write_all(&self, cache: &PersistedCache) -> Result<(), McpError> {
        let content = serde_json::to_string_pretty(cache).map_err(|e| McpError::CacheError {
            reason: format!("failed to serialize discovery cache: {e}"),
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| McpError::CacheError {
                reason: format!("failed to create {}: {e}", parent.display()),
            })?;
        }

        // Write to temp file, then rename for atomicity
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).map_err(|e| McpError::CacheError {
            reason: format!("failed to write {}: {e}", tmp_path.display()),
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| McpError::CacheError {
            reason: format!("failed to replace {}: {e}", self.path.display()),
        })
    }
}

impl DiscoveryCache for JsonFileCache {
    fn load(&self, server: &str) -> Result<Option<ServerToolsRecord>, McpError> {
        Ok(self.read_all()?.servers.remove(server))
    }

    fn store(&self, server: &str, record: ServerToolsRecord) -> Result<(), McpError> {
        let _guard = self.write_lock.lock().map_err(|_| McpError::CacheError {
            reason: "discovery cache lock poisoned".into(),
        })?;

        let mut cache = self.read_all()?;
        cache.version = CACHE_VERSION;
        cache.servers.insert(server.to_string(), record);
        self.write_all(&cache)?;

        tracing::debug!(server, path = %self.path.display(), "discovery cache updated");
        Ok(())
    }
}

// ─── Memory Cache ────────────────────────────────────────────────────────────

/// In-process cache for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: Mutex<HashMap<String, ServerToolsRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DiscoveryCache for MemoryCache {
    fn load(&self, server: &str) -> Result<Option<ServerToolsRecord>, McpError> {
        let records = self.records.lock().map_err(|_| McpError::CacheError {
            reason: "memory cache lock poisoned".into(),
        })?;
        Ok(records.get(server).cloned())
    }

    fn store(&self, server: &str, record: ServerToolsRecord) -> Result<(), McpError> {
        let mut records = self.records.lock().map_err(|_| McpError::CacheError {
            reason: "memory cache lock poisoned".into(),
        })?;
        records.insert(server.to_string(), record);
        Ok(())
    }
}
