//! Content-addressed bundle cache.
//!
//! One JSON file per key in a flat directory. The key is
//! `sha256(source_id + content)`; an entry is only valid while both the
//! content hash and the toolchain version match.
//!
//! The cache never fails a build: unreadable, corrupt or stale entries are
//! misses, and write failures are reported as an outcome and logged.
//! There is no lock file. Concurrent writers race and the last rename wins;
//! readers never observe a partially written entry.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::generator::{LineMap, ScriptMeta};
use crate::sourcemap::SourceMapV3;

/// Environment override for the cache directory.
pub const CACHE_DIR_ENV: &str = "MELKER_CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub content_hash: String,
    pub bundled_code: String,
    pub line_map: LineMap,
    pub template: String,
    pub toolchain_version: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_map: Option<SourceMapV3>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub script_meta: Vec<ScriptMeta>,
}

#[derive(Debug, Deserialize)]
struct EntryTimestamp {
    timestamp: i64,
}

#[derive(Debug)]
pub enum CacheLookup {
    Hit(Box<CacheEntry>),
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    NotFound,
    Unreadable(String),
    Corrupt(String),
    ContentChanged,
    ToolchainChanged { cached: String, current: String },
}

#[derive(Debug)]
pub enum StoreOutcome {
    Stored(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub count: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BundleCache {
    dir: PathBuf,
}

impl BundleCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `MELKER_CACHE_DIR`, else `<platform cache dir>/melker/bundles`.
    pub fn default_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("melker")
            .join("bundles")
    }

    pub fn open(dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) => Self::new(dir),
            None => Self::new(Self::default_dir()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn cache_key(source_id: &str, content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn entry_path(&self, source_id: &str, content: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::cache_key(source_id, content)))
    }

    /// Look up a previous bundle. Never fails; every problem is a miss.
    pub async fn lookup(&self, source_id: &str, content: &str, toolchain_version: &str) -> CacheLookup {
        let path = self.entry_path(source_id, content);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return CacheLookup::Miss(MissReason::NotFound)
            }
            Err(e) => {
                debug!(path = %path.display(), "cache entry unreadable: {e}");
                return CacheLookup::Miss(MissReason::Unreadable(e.to_string()));
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), "discarding corrupt cache entry: {e}");
                tokio::fs::remove_file(&path).await.ok();
                return CacheLookup::Miss(MissReason::Corrupt(e.to_string()));
            }
        };

        if entry.content_hash != Self::content_hash(content) {
            return CacheLookup::Miss(MissReason::ContentChanged);
        }
        if entry.toolchain_version != toolchain_version {
            return CacheLookup::Miss(MissReason::ToolchainChanged {
                cached: entry.toolchain_version,
                current: toolchain_version.to_string(),
            });
        }

        debug!(source = source_id, "bundle cache hit");
        CacheLookup::Hit(Box::new(entry))
    }

    /// Build an entry stamped with the current time.
    pub fn entry_for(
        content: &str,
        bundled_code: String,
        line_map: LineMap,
        template: String,
        toolchain_version: &str,
    ) -> CacheEntry {
        CacheEntry {
            content_hash: Self::content_hash(content),
            bundled_code,
            line_map,
            template,
            toolchain_version: toolchain_version.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            source_map: None,
            script_meta: Vec::new(),
        }
    }

    /// Persist an entry. Best-effort: failures are logged and returned.
    pub async fn store(&self, source_id: &str, content: &str, entry: &CacheEntry) -> StoreOutcome {
        let path = self.entry_path(source_id, content);
        match self.write_atomic(&path, entry).await {
            Ok(()) => {
                debug!(path = %path.display(), "bundle cached");
                StoreOutcome::Stored(path)
            }
            Err(e) => {
                warn!(path = %path.display(), "failed to write bundle cache: {e}");
                StoreOutcome::Failed(e.to_string())
            }
        }
    }

    async fn write_atomic(&self, path: &Path, entry: &CacheEntry) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let data = serde_json::to_vec(entry)?;
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        tokio::fs::write(&tmp, data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e);
        }
        Ok(())
    }

    async fn entry_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e),
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_timestamp(path: &Path) -> Option<i64> {
        let data = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice::<EntryTimestamp>(&data)
            .ok()
            .map(|e| e.timestamp)
    }

    /// Remove every entry. Returns the number removed.
    pub async fn clear(&self) -> io::Result<usize> {
        let mut removed = 0;
        for path in self.entry_files().await? {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove entries older than `max_age` (and unreadable ones).
    pub async fn clear_older_than(&self, max_age: Duration) -> io::Result<usize> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(max_age_ms);
        let mut removed = 0;
        for path in self.entry_files().await? {
            let stale = match Self::read_timestamp(&path).await {
                Some(timestamp) => timestamp < cutoff,
                None => true,
            };
            if stale {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Scan the directory. No index is kept.
    pub async fn stats(&self) -> io::Result<CacheStats> {
        let mut stats = CacheStats::default();
        for path in self.entry_files().await? {
            let metadata = tokio::fs::metadata(&path).await?;
            stats.count += 1;
            stats.total_bytes += metadata.len();

            let Some(stamp) = Self::read_timestamp(&path)
                .await
                .and_then(DateTime::<Utc>::from_timestamp_millis)
            else {
                continue;
            };
            stats.oldest = Some(stats.oldest.map_or(stamp, |o| o.min(stamp)));
            stats.newest = Some(stats.newest.map_or(stamp, |n| n.max(stamp)));
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
