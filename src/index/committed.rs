//! Committed Index (§4.4): a [`MergedIndex`] plus a dictionary of currently-open pack
//! indexes and a pluggable cache so repeated opens don't re-fetch index blobs from the
//! blob store.
//!
//! Grounded in the teacher's `backend::cache::Cache` for the on-disk shape (a directory of
//! files keyed by id), generalized to the single flat `<blob_id>.sndx` naming this format
//! calls for rather than the teacher's `FileType`-typed 2-nibble sharded tree, since index
//! blobs are comparatively few and don't need shard fan-out. The teacher's cache writes
//! files directly via `OpenOptions::create(true).write(true)` with no temp-file-then-rename
//! step; this format's `add` needs that atomicity (concurrent writers may race to cache the
//! same blob), so the on-disk implementation here uses `tempfile::NamedTempFile` instead.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, UNIX_EPOCH};

use crate::clock::Clock;
use crate::error::{CacheErrorKind, CoreResult};
use crate::index::format::PackIndex;
use crate::index::merged::{MergedIndex, ReadIndex};
use crate::id::ContentId;
use crate::index::record::BlockInfo;

/// How long an index blob may sit unused in an on-disk cache before `expire_unused` reclaims
/// it.
const EXPIRE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Pluggable storage for parsed index blobs, shared by every open [`CommittedIndex`].
pub trait CommittedIndexCache: Send + Sync {
    fn has(&self, blob_id: &str) -> bool;

    /// Idempotent: store `data` so a subsequent `open` doesn't need to re-fetch it.
    fn add(&self, blob_id: &str, data: &[u8]) -> CoreResult<()>;

    fn open(&self, blob_id: &str) -> CoreResult<PackIndex>;

    /// Delete entries not in `used_set` that have been idle longer than one hour.
    fn expire_unused(&self, used_set: &[String]) -> CoreResult<()>;
}

/// In-memory cache: holds every parsed index for the lifetime of the process. `expire_unused`
/// is a no-op, matching §4.4's description of this variant.
#[derive(Default)]
pub struct MemoryIndexCache {
    entries: Mutex<HashMap<String, PackIndex>>,
}

impl MemoryIndexCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommittedIndexCache for MemoryIndexCache {
    fn has(&self, blob_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(blob_id)
    }

    fn add(&self, blob_id: &str, data: &[u8]) -> CoreResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(blob_id) {
            let parsed = PackIndex::parse(data.to_vec())?;
            entries.insert(blob_id.to_owned(), parsed);
        }
        Ok(())
    }

    fn open(&self, blob_id: &str) -> CoreResult<PackIndex> {
        self.entries
            .lock()
            .unwrap()
            .get(blob_id)
            .cloned()
            .ok_or_else(|| CacheErrorKind::MalformedEntry.into())
    }

    fn expire_unused(&self, _used_set: &[String]) -> CoreResult<()> {
        Ok(())
    }
}

/// On-disk cache: one `<blob_id>.sndx` file per index blob in `dir`.
pub struct DiskIndexCache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl DiskIndexCache {
    /// Creates the cache directory if it doesn't already exist.
    pub fn new(dir: PathBuf, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        fs::create_dir_all(&dir).map_err(CacheErrorKind::FromIoError)?;
        Ok(Self { dir, clock })
    }

    fn path(&self, blob_id: &str) -> PathBuf {
        self.dir.join(format!("{blob_id}.sndx"))
    }
}

impl CommittedIndexCache for DiskIndexCache {
    fn has(&self, blob_id: &str) -> bool {
        self.path(blob_id).is_file()
    }

    /// Writes to a temp file in the same directory and renames into place. If the
    /// destination already exists (a concurrent writer won the race), the existing file is
    /// accepted as authoritative and the temp file is discarded.
    fn add(&self, blob_id: &str, data: &[u8]) -> CoreResult<()> {
        let dest = self.path(blob_id);
        if dest.is_file() {
            return Ok(());
        }
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(CacheErrorKind::FromIoError)?;
        std::io::Write::write_all(&mut tmp, data)
            .map_err(CacheErrorKind::FromIoError)?;
        match tmp.persist(&dest) {
            Ok(_) => Ok(()),
            Err(err) if dest.is_file() => {
                // lost the rename race to a concurrent writer; their file is authoritative.
                drop(err);
                Ok(())
            }
            Err(err) => Err(CacheErrorKind::FromIoError(err.error).into()),
        }
    }

    fn open(&self, blob_id: &str) -> CoreResult<PackIndex> {
        let bytes = fs::read(self.path(blob_id)).map_err(CacheErrorKind::FromIoError)?;
        let index = PackIndex::parse(bytes)?;
        // bump mtime so expire_unused's one-hour idle check restarts from this open.
        let now = UNIX_EPOCH + Duration::from_secs(self.clock.now_seconds());
        let _ = filetime::set_file_mtime(self.path(blob_id), filetime::FileTime::from_system_time(now));
        Ok(index)
    }

    fn expire_unused(&self, used_set: &[String]) -> CoreResult<()> {
        let used: std::collections::HashSet<&str> = used_set.iter().map(String::as_str).collect();
        let now_seconds = self.clock.now_seconds();
        let entries = fs::read_dir(&self.dir).map_err(CacheErrorKind::FromIoError)?;
        for entry in entries {
            let entry = entry.map_err(CacheErrorKind::FromIoError)?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(blob_id) = name.strip_suffix(".sndx") else { continue };
            if used.contains(blob_id) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            let modified_seconds = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let idle = now_seconds.saturating_sub(modified_seconds);
            if idle > EXPIRE_AFTER.as_secs() {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

/// The active, queryable view of the repository's committed blocks: a [`MergedIndex`] over
/// whichever index blobs are currently `in_use`, backed by a [`CommittedIndexCache`].
pub struct CommittedIndex {
    cache: Arc<dyn CommittedIndexCache>,
    in_use: RwLock<HashMap<String, PackIndex>>,
    active: RwLock<Arc<MergedIndex>>,
}

impl CommittedIndex {
    #[must_use]
    pub fn new(cache: Arc<dyn CommittedIndexCache>) -> Self {
        Self {
            cache,
            in_use: RwLock::new(HashMap::new()),
            active: RwLock::new(Arc::new(MergedIndex::default())),
        }
    }

    /// A cheap snapshot of the currently-active merged view, safe to query without holding
    /// any manager-level lock (the `Arc` keeps it alive even if `use_blobs` swaps it out from
    /// under a concurrent reader).
    #[must_use]
    pub fn snapshot(&self) -> Arc<MergedIndex> {
        self.active.read().unwrap().clone()
    }

    pub fn get_info(&self, content_id: &ContentId) -> Option<BlockInfo> {
        self.snapshot().get_info(content_id)
    }

    /// `add_block(blob_id, data, use)`: ensure the cache has `data` under `blob_id`; if `use`
    /// is true, also open it and merge into the active set.
    pub fn add_block(&self, blob_id: &str, data: &[u8], use_now: bool) -> CoreResult<()> {
        self.cache.add(blob_id, data)?;
        if use_now {
            let mut in_use = self.in_use.write().unwrap();
            if !in_use.contains_key(blob_id) {
                let index = self.cache.open(blob_id)?;
                in_use.insert(blob_id.to_owned(), index);
            }
            let ids: Vec<String> = in_use.keys().cloned().collect();
            drop(in_use);
            self.rebuild_active(&ids);
        }
        Ok(())
    }

    /// `use(blob_id_list)`: replace the active set with exactly `blob_id_list`, fetching
    /// (via `fetch`) and caching any blob not already held locally. Returns `false` without
    /// doing anything if the set is unchanged (`"not updated"` in §4.4's terms).
    pub fn use_blobs(
        &self,
        blob_id_list: &[String],
        fetch: impl Fn(&str) -> CoreResult<Vec<u8>>,
    ) -> CoreResult<bool> {
        {
            let in_use = self.in_use.read().unwrap();
            if in_use.len() == blob_id_list.len()
                && blob_id_list.iter().all(|id| in_use.contains_key(id))
            {
                return Ok(false);
            }
        }

        let mut in_use = self.in_use.write().unwrap();
        let mut next = HashMap::with_capacity(blob_id_list.len());
        for blob_id in blob_id_list {
            if let Some(index) = in_use.remove(blob_id) {
                next.insert(blob_id.clone(), index);
                continue;
            }
            if !self.cache.has(blob_id) {
                let data = fetch(blob_id)?;
                self.cache.add(blob_id, &data)?;
            }
            let index = self.cache.open(blob_id)?;
            next.insert(blob_id.clone(), index);
        }
        *in_use = next;
        let ids: Vec<String> = in_use.keys().cloned().collect();
        drop(in_use);

        self.rebuild_active(&ids);
        self.cache.expire_unused(blob_id_list)?;
        Ok(true)
    }

    fn rebuild_active(&self, ids: &[String]) {
        let in_use = self.in_use.read().unwrap();
        let indexes = ids
            .iter()
            .filter_map(|id| in_use.get(id).cloned())
            .collect();
        *self.active.write().unwrap() = Arc::new(MergedIndex::new(indexes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::index::builder::PackIndexBuilder;
    use std::time::SystemTime;

    fn disk_cache_in(dir: &std::path::Path) -> DiskIndexCache {
        DiskIndexCache::new(dir.to_path_buf(), Arc::new(SystemClock)).unwrap()
    }

    fn pack_index_bytes(id: &ContentId, ts: u64) -> Vec<u8> {
        let mut builder = PackIndexBuilder::new();
        builder.add(BlockInfo::new_pending(id.clone(), ts, vec![1, 2, 3]));
        builder.build().unwrap()
    }

    #[test]
    fn add_block_with_use_makes_it_queryable() {
        let cache = Arc::new(MemoryIndexCache::new());
        let committed = CommittedIndex::new(cache);
        let id = ContentId::new(Some('g'), &[1, 2, 3, 4]).unwrap();
        let bytes = pack_index_bytes(&id, 10);
        committed.add_block("n1", &bytes, true).unwrap();
        assert!(committed.get_info(&id).is_some());
    }

    #[test]
    fn use_blobs_reports_not_updated_on_same_set() {
        let cache = Arc::new(MemoryIndexCache::new());
        let committed = CommittedIndex::new(cache);
        let id = ContentId::new(Some('g'), &[9]).unwrap();
        let bytes = pack_index_bytes(&id, 5);
        let fetch = |_: &str| -> CoreResult<Vec<u8>> { Ok(bytes.clone()) };
        assert!(committed.use_blobs(&["n1".to_owned()], fetch).unwrap());
        assert!(!committed.use_blobs(&["n1".to_owned()], fetch).unwrap());
    }

    #[test]
    fn disk_cache_add_is_idempotent_on_rename_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache_in(dir.path());
        let id = ContentId::new(None, &[1, 1, 1, 1]).unwrap();
        let bytes = pack_index_bytes(&id, 1);
        cache.add("n1", &bytes).unwrap();
        // second add with different bytes must not clobber the first writer's file.
        cache.add("n1", b"garbage").unwrap();
        let index = cache.open("n1").unwrap();
        assert!(index.get(&id).is_some());
    }

    #[test]
    fn disk_cache_expire_unused_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = disk_cache_in(dir.path());
        let id = ContentId::new(None, &[2, 2, 2, 2]).unwrap();
        let bytes = pack_index_bytes(&id, 1);
        cache.add("stale", &bytes).unwrap();
        let past = SystemTime::now() - Duration::from_secs(3 * 60 * 60);
        filetime::set_file_mtime(
            dir.path().join("stale.sndx"),
            filetime::FileTime::from_system_time(past),
        )
        .unwrap();
        cache.expire_unused(&[]).unwrap();
        assert!(!cache.has("stale"));
    }
}
