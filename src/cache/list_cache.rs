//! The List Cache (§4.7): makes repeated "list pack-index blobs" calls cheap and consistent.
//!
//! Persists a snapshot `{timestamp, [BlobMetadata...]}` as a single local file, written the
//! same temp-file-then-rename way [`crate::index::committed::DiskIndexCache`] writes cache
//! entries — grounded on that module's atomicity rationale, since two `ListCache` users racing
//! to refresh the snapshot must not observe a half-written file. There's no teacher
//! counterpart: `rustic_core` lists backend files directly on every access rather than caching
//! the listing.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{list_all_blobs_consistent, BlobMetadata, BlobStore};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::error::{CacheErrorKind, CoreResult};

/// Prefix used to list pack-index blobs (§3's naming convention: index blobs are named
/// `"n" + hex(...)`).
pub const INDEX_BLOB_PREFIX: &str = "n";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    timestamp_seconds: u64,
    blobs: Vec<BlobMetadata>,
}

/// Caches the result of `ListAllBlobsConsistent("n", ...)` for up to `ttl`, persisted as a
/// single local file so it survives across `BlockManager` instances pointed at the same cache
/// directory.
pub struct ListCache {
    path: PathBuf,
    ttl: Duration,
    max_attempts: u32,
    ignore: Mutex<bool>,
    clock: Arc<dyn Clock>,
}

impl ListCache {
    /// Creates the cache file's parent directory if needed. `path` is the snapshot file's
    /// full path (not a directory).
    pub fn new(path: PathBuf, ttl: Duration, max_attempts: u32, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(CacheErrorKind::FromIoError)?;
        }
        Ok(Self {
            path,
            ttl,
            max_attempts,
            ignore: Mutex::new(false),
            clock,
        })
    }

    /// Sets the "ignore list cache" flag: while set, every `list` call re-lists from `store`
    /// regardless of a fresh on-disk snapshot.
    pub fn set_ignore(&self, ignore: bool) {
        *self.ignore.lock().unwrap() = ignore;
    }

    fn read_snapshot(&self) -> Option<Snapshot> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> CoreResult<()> {
        let bytes = serde_json::to_vec(snapshot).expect("Snapshot has no non-string map keys");
        let dir = self
            .path
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(CacheErrorKind::FromIoError)?;
        std::io::Write::write_all(&mut tmp, &bytes).map_err(CacheErrorKind::FromIoError)?;
        match tmp.persist(&self.path) {
            Ok(_) => Ok(()),
            Err(err) => Err(CacheErrorKind::FromIoError(err.error).into()),
        }
    }

    /// Returns a fresh listing of pack-index blobs: a cached snapshot if present, not expired,
    /// and the ignore flag isn't set; otherwise re-lists via
    /// [`crate::backend::list_all_blobs_consistent`] and persists the result.
    ///
    /// # Errors
    ///
    /// Propagates cancellation and `list_all_blobs_consistent`'s error.
    pub fn list(&self, store: &dyn BlobStore, cancel: &CancellationToken) -> CoreResult<Vec<BlobMetadata>> {
        cancel.check()?;
        let ignore = *self.ignore.lock().unwrap();
        if !ignore {
            if let Some(snapshot) = self.read_snapshot() {
                let age = self.clock.now_seconds().saturating_sub(snapshot.timestamp_seconds);
                if Duration::from_secs(age) <= self.ttl {
                    return Ok(snapshot.blobs);
                }
            }
        }

        let blobs = list_all_blobs_consistent(store, INDEX_BLOB_PREFIX, self.max_attempts, cancel)?;
        let timestamp_seconds = self.clock.now_seconds();
        self.write_snapshot(&Snapshot {
            timestamp_seconds,
            blobs: blobs.clone(),
        })?;
        Ok(blobs)
    }

    /// Invalidates the cached snapshot (§4.7: called on every pack/index blob Put or index
    /// blob delete). A missing file is not an error.
    pub fn delete_list_cache(&self) -> CoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheErrorKind::FromIoError(err).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::MemoryBlobStore;
    use crate::clock::{FrozenClock, SystemClock};

    fn cache_in(dir: &std::path::Path, ttl: Duration) -> ListCache {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        ListCache::new(dir.join("list.json"), ttl, 4, clock).unwrap()
    }

    #[test]
    fn first_list_populates_the_snapshot_and_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), Duration::from_secs(60));
        let store = MemoryBlobStore::new();
        let cancel = CancellationToken::new();
        store.put_blob("n1", b"abc", &cancel).unwrap();

        let first = cache.list(&store, &cancel).unwrap();
        assert_eq!(first.len(), 1);

        // A blob added after the snapshot was taken must not appear until invalidated.
        store.put_blob("n2", b"def", &cancel).unwrap();
        let second = cache.list(&store, &cancel).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn delete_list_cache_forces_a_fresh_listing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), Duration::from_secs(60));
        let store = MemoryBlobStore::new();
        let cancel = CancellationToken::new();
        store.put_blob("n1", b"abc", &cancel).unwrap();
        cache.list(&store, &cancel).unwrap();

        store.put_blob("n2", b"def", &cancel).unwrap();
        cache.delete_list_cache().unwrap();
        let refreshed = cache.list(&store, &cancel).unwrap();
        assert_eq!(refreshed.len(), 2);
    }

    #[test]
    fn ignore_flag_forces_a_fresh_listing_without_deleting_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path(), Duration::from_secs(60));
        let store = MemoryBlobStore::new();
        let cancel = CancellationToken::new();
        store.put_blob("n1", b"abc", &cancel).unwrap();
        cache.list(&store, &cancel).unwrap();

        store.put_blob("n2", b"def", &cancel).unwrap();
        cache.set_ignore(true);
        let refreshed = cache.list(&store, &cancel).unwrap();
        assert_eq!(refreshed.len(), 2);
    }

    #[test]
    fn snapshot_expires_against_the_injected_clock() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FrozenClock::new(1_000));
        let cache = ListCache::new(
            dir.path().join("list.json"),
            Duration::from_secs(30),
            4,
            clock.clone(),
        )
        .unwrap();
        let store = MemoryBlobStore::new();
        let cancel = CancellationToken::new();
        store.put_blob("n1", b"abc", &cancel).unwrap();
        cache.list(&store, &cancel).unwrap();

        store.put_blob("n2", b"def", &cancel).unwrap();
        clock.advance(29);
        assert_eq!(cache.list(&store, &cancel).unwrap().len(), 1, "still within ttl");

        clock.advance(2);
        assert_eq!(cache.list(&store, &cancel).unwrap().len(), 2, "ttl elapsed, re-lists");
    }
}
