//! Block Manager (§4.2): the single synchronous, mutex-guarded orchestrator tying the Pending
//! Pack, Pack-Index Builder, Committed Index, Block Cache, and List Cache together behind
//! `WriteBlock`/`GetBlock`/`DeleteBlock`/`Flush` and the maintenance operations.
//!
//! Grounded in the teacher's `repository::Repository`/`blob::BlobType` orchestration layer for
//! the overall shape (one struct owning every collaborator, public methods that acquire a lock,
//! do their work, and release it), but the concurrency model itself is a deliberate departure:
//! the teacher dispatches pack assembly to a channel-fed worker pool
//! (`archiver::packer::Packer`), whereas this format's §5 calls for a single mutex guarding all
//! mutable state, released only around blob-store I/O. There is exactly one writer's worth of
//! pending state at a time; concurrent writers serialize at the mutex rather than fan out to
//! workers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use rand::RngCore;

use crate::backend::{list_all_blobs_consistent, BlobMetadata, BlobStore};
use crate::backend::local::LocalBlobStore;
use crate::cache::{BlockCache, ListCache};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::crypto::Formatter;
use crate::error::{
    BackendErrorKind, CoreError, CoreErrorKind, CoreResult, ManagerErrorKind,
};
use crate::id::{ContentId, CLIENT_PREFIX_RANGE};
use crate::index::builder::PackIndexBuilder;
use crate::index::committed::{CommittedIndex, CommittedIndexCache, DiskIndexCache, MemoryIndexCache};
use crate::index::format::PackIndex;
use crate::index::merged::ReadIndex;
use crate::index::record::BlockInfo;
use crate::options::{CachingOptions, FormattingOptions};
use crate::pack::{assemble_pack, content_id_iv, recover_local_index, PackLayout};
use crate::progress::Progress;
use crate::stats::{Stats, StatsSnapshot};

/// Lowest repository format version this implementation can read (§3).
pub const MIN_SUPPORTED_READ_VERSION: u8 = 0;
/// Format version newly-written packs and index blobs use (§3).
pub const CURRENT_WRITE_VERSION: u8 = 1;
/// A pack-index builder is flushed to a new index blob at least this often, even if it
/// never grows large (§4.2 step 10, §9).
pub const FLUSH_INDEX_INTERVAL_SECONDS: u64 = 600;

const BACKOFF_START_MS: u64 = 100;
const BACKOFF_MAX_ATTEMPTS: u32 = 10;

const PACK_BLOB_PREFIX: &str = "p";
const INDEX_BLOB_PREFIX: &str = "n";
const LIST_CACHE_FILE_NAME: &str = "list-cache.json";
const LIST_CACHE_MAX_ATTEMPTS: u32 = 4;

/// Selection policy for `CompactIndexes` (§4.8).
#[derive(Debug, Clone, Copy)]
pub struct CompactOptions {
    /// Do nothing unless at least this many eligible index blobs exist.
    pub min_small_blobs: usize,
    /// Never fold more than this many index blobs into one compaction pass.
    pub max_small_blobs: usize,
    /// Consider every index blob regardless of size, not just ones at or under `max_pack_size`.
    pub all_blobs: bool,
    /// Drop tombstones older than this instead of carrying them forward indefinitely.
    pub skip_deleted_older_than: Option<Duration>,
}

impl Default for CompactOptions {
    fn default() -> Self {
        Self {
            min_small_blobs: 10,
            max_small_blobs: 100,
            all_blobs: false,
            skip_deleted_older_than: None,
        }
    }
}

struct Inner {
    pending_by_id: HashMap<String, BlockInfo>,
    pack_index_builder: PackIndexBuilder,
    pending_data_length: u64,
    flush_pack_indexes_after: u64,
    disable_index_flush_count: u32,
}

/// The Block Manager (§4.2): construct one per repository session, then drive every block
/// operation through its methods. `Send + Sync`; safe to share behind an `Arc` across threads.
pub struct BlockManager {
    blob_store: Arc<dyn BlobStore>,
    formatter: Formatter,
    max_pack_size: u64,
    write_format_version: u8,
    repository_format_bytes: Vec<u8>,
    layout: PackLayout,
    block_cache: Arc<BlockCache>,
    list_cache: Option<ListCache>,
    committed_index: CommittedIndex,
    clock: Arc<dyn Clock>,
    invariant_check: bool,
    stats: Stats,
    inner: Mutex<Inner>,
    sweeper_cancel: CancellationToken,
    sweeper_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn is_transient(err: &CoreError) -> bool {
    matches!(
        err.kind(),
        CoreErrorKind::Backend(BackendErrorKind::Transient(_))
    )
}

impl BlockManager {
    /// Construct a `BlockManager` over `blob_store`: validates `formatting.version`, builds the
    /// `Formatter` and the optional on-disk Block/List/Committed-Index caches per `caching`,
    /// then performs an initial `load_pack_indexes` and `compact_indexes` pass (§9: "opening a
    /// repository always leaves the Committed Index in the most compact state it can cheaply
    /// reach").
    ///
    /// # Errors
    ///
    /// Returns [`ManagerErrorKind::FormatVersionTooNew`] if `formatting.version` exceeds
    /// [`CURRENT_WRITE_VERSION`], [`ManagerErrorKind::FormatVersionTooOld`] if it is below
    /// [`MIN_SUPPORTED_READ_VERSION`], [`ManagerErrorKind::RepositoryFormatTooLarge`] if
    /// `repository_format_bytes` alone would exceed `formatting.max_pack_size`, and propagates
    /// `Formatter::new` and cache-construction errors.
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        formatting: &FormattingOptions,
        caching: &CachingOptions,
        repository_format_bytes: Vec<u8>,
        clock: Arc<dyn Clock>,
        invariant_check: bool,
        progress: &impl Progress,
        cancel: &CancellationToken,
    ) -> CoreResult<Self> {
        if formatting.version > CURRENT_WRITE_VERSION {
            return Err(ManagerErrorKind::FormatVersionTooNew {
                found: formatting.version,
                current: CURRENT_WRITE_VERSION,
            }
            .into());
        }
        if formatting.version < MIN_SUPPORTED_READ_VERSION {
            return Err(ManagerErrorKind::FormatVersionTooOld {
                found: formatting.version,
                min: MIN_SUPPORTED_READ_VERSION,
            }
            .into());
        }
        if repository_format_bytes.len() as u64 >= formatting.max_pack_size {
            return Err(ManagerErrorKind::RepositoryFormatTooLarge.into());
        }

        let formatter = Formatter::new(
            &formatting.hash,
            &formatting.encryption,
            &formatting.hmac_secret,
            &formatting.master_key,
        )?;

        let block_cache_store: Option<Box<dyn BlobStore>> =
            if caching.use_block_cache && !caching.cache_directory.is_empty() {
                let dir = std::path::Path::new(&caching.cache_directory).join("blocks");
                Some(Box::new(LocalBlobStore::new(dir, true)?))
            } else {
                None
            };
        let block_cache = Arc::new(BlockCache::new(
            block_cache_store,
            caching.hmac_secret.clone(),
            caching.max_cache_size_bytes,
            clock.clone(),
        ));
        let sweeper_cancel = CancellationToken::new();
        let sweeper_handle = block_cache.spawn_sweeper(sweeper_cancel.clone());

        let list_cache = if caching.use_list_cache && !caching.cache_directory.is_empty() {
            let path = std::path::Path::new(&caching.cache_directory).join(LIST_CACHE_FILE_NAME);
            let cache = ListCache::new(
                path,
                Duration::from_secs(caching.max_list_cache_duration_sec),
                LIST_CACHE_MAX_ATTEMPTS,
                clock.clone(),
            )?;
            cache.set_ignore(caching.ignore_list_cache);
            Some(cache)
        } else {
            None
        };

        let index_cache: Arc<dyn CommittedIndexCache> = if caching.index_cache_directory.is_empty()
        {
            Arc::new(MemoryIndexCache::new())
        } else {
            Arc::new(DiskIndexCache::new(
                std::path::PathBuf::from(&caching.index_cache_directory),
                clock.clone(),
            )?)
        };
        let committed_index = CommittedIndex::new(index_cache);

        let now = clock.now_seconds();
        let manager = Self {
            blob_store,
            formatter,
            max_pack_size: formatting.max_pack_size,
            write_format_version: formatting.version,
            repository_format_bytes,
            layout: PackLayout::default(),
            block_cache,
            list_cache,
            committed_index,
            clock,
            invariant_check,
            stats: Stats::new(),
            inner: Mutex::new(Inner {
                pending_by_id: HashMap::new(),
                pack_index_builder: PackIndexBuilder::new(),
                pending_data_length: 0,
                flush_pack_indexes_after: now + FLUSH_INDEX_INTERVAL_SECONDS,
                disable_index_flush_count: 0,
            }),
            sweeper_cancel,
            sweeper_handle: Mutex::new(sweeper_handle),
        };

        manager.load_pack_indexes(progress, cancel)?;
        manager.compact_indexes(&CompactOptions::default(), progress, cancel)?;
        Ok(manager)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Closes the manager (§5): stops the block cache's background sweeper and waits for it to
    /// exit. Idempotent; safe to call more than once, and called automatically on drop.
    pub fn close(&self) {
        self.sweeper_cancel.cancel();
        if let Some(handle) = self.sweeper_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn lookup(&self, inner: &Inner, content_id: &ContentId) -> Option<BlockInfo> {
        if let Some(info) = inner.pending_by_id.get(content_id.as_str()) {
            return Some(info.clone());
        }
        if let Some(info) = inner.pack_index_builder.get(content_id) {
            return Some(info.clone());
        }
        self.committed_index.get_info(content_id)
    }

    fn snapshot_pending(inner: &Inner) -> Vec<BlockInfo> {
        inner.pending_by_id.values().cloned().collect()
    }

    /// `WriteBlock(data, prefix)` (§4.2): idempotent by content id. A live duplicate is a
    /// no-op that returns the existing id; a tombstoned duplicate is revived with a fresh
    /// timestamp. Triggers a pack finalize once pending bytes reach `max_pack_size`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreErrorKind::InvalidPrefix`] for a `prefix` outside `g..=z`, and propagates
    /// cancellation and pack-write errors.
    pub fn write_block(
        &self,
        data: &[u8],
        prefix: Option<char>,
        cancel: &CancellationToken,
    ) -> CoreResult<ContentId> {
        cancel.check()?;
        if let Some(p) = prefix {
            if !CLIENT_PREFIX_RANGE.contains(&p) {
                return Err(CoreErrorKind::InvalidPrefix(p).into());
            }
        }

        let hash = self.formatter.compute_id(data);
        self.stats.record_hash(data.len() as u64);
        let content_id = ContentId::new(prefix, &hash)?;
        let now = self.clock.now_seconds();

        let to_finish = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(existing) = self.lookup(&inner, &content_id) {
                if !existing.deleted {
                    return Ok(content_id);
                }
            }

            let info = BlockInfo::new_pending(content_id.clone(), now, data.to_vec());
            inner
                .pending_by_id
                .insert(content_id.as_str().to_owned(), info.clone());
            inner.pack_index_builder.add(info);
            inner.pending_data_length += data.len() as u64;

            if inner.pending_data_length >= self.max_pack_size {
                Some(Self::snapshot_pending(&inner))
            } else {
                None
            }
        };

        if let Some(entries) = to_finish {
            self.finish_pending_pack(entries, cancel)?;
        }

        Ok(content_id)
    }

    /// `GetBlock(content_id)` (§4.2): resolve metadata (pending, pack-index builder, or
    /// committed index, in that order), then fetch and decrypt the payload if it's not still
    /// carried inline.
    ///
    /// # Errors
    ///
    /// Returns [`CoreErrorKind::BlockNotFound`] if the id is unknown or tombstoned, and
    /// propagates cache, decryption, and authentication failures.
    pub fn get_block(&self, content_id: &ContentId, cancel: &CancellationToken) -> CoreResult<Vec<u8>> {
        cancel.check()?;
        let info = {
            let inner = self.inner.lock().unwrap();
            self.lookup(&inner, content_id)
        };
        let info = info.ok_or_else(|| CoreErrorKind::BlockNotFound(content_id.as_str().to_owned()))?;
        if info.deleted {
            return Err(CoreErrorKind::BlockNotFound(content_id.as_str().to_owned()).into());
        }
        if let Some(payload) = &info.inline_payload {
            self.stats.record_read(payload.len() as u64);
            return Ok(payload.clone());
        }

        let pack_blob_id = info
            .pack_blob_id
            .clone()
            .ok_or_else(|| CoreErrorKind::BlockNotFound(content_id.as_str().to_owned()))?;
        let stored = self.block_cache.get_or_fetch(
            content_id.as_str(),
            self.blob_store.as_ref(),
            &pack_blob_id,
            u64::from(info.pack_offset),
            u64::from(info.length),
            false,
            cancel,
        )?;
        self.stats.record_read(stored.len() as u64);

        let plaintext = if info.format_version >= 1 {
            let iv = content_id_iv(content_id);
            let out = self.formatter.decrypt(&stored, &iv)?;
            self.stats.record_decrypt(out.len() as u64);
            out
        } else {
            stored
        };

        if !self.formatter.is_authenticated() {
            if let Err(err) = self
                .formatter
                .verify_content_hash(&plaintext, &content_id.hash_bytes())
            {
                self.stats.record_invalid();
                return Err(err);
            }
        }
        self.stats.record_valid();
        Ok(plaintext)
    }

    /// `BlockInfo(content_id)` (§4.2): metadata only, no payload fetch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreErrorKind::BlockNotFound`] if the id is unknown.
    pub fn block_info(&self, content_id: &ContentId) -> CoreResult<BlockInfo> {
        let inner = self.inner.lock().unwrap();
        self.lookup(&inner, content_id)
            .ok_or_else(|| CoreErrorKind::BlockNotFound(content_id.as_str().to_owned()).into())
    }

    /// `DeleteBlock(content_id)` (§4.2): a pending block with no `pack_blob_id` yet is removed
    /// outright; anything already packed or committed is tombstoned with the current time. A
    /// block already tombstoned is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreErrorKind::BlockNotFound`] if the id is unknown anywhere.
    pub fn delete_block(&self, content_id: &ContentId, cancel: &CancellationToken) -> CoreResult<()> {
        cancel.check()?;
        let now = self.clock.now_seconds();
        let mut inner = self.inner.lock().unwrap();
        let key = content_id.as_str().to_owned();

        if let Some(pending) = inner.pending_by_id.get(&key).cloned() {
            if !pending.deleted && pending.pack_blob_id.is_none() {
                inner.pending_by_id.remove(&key);
                inner.pack_index_builder.remove(content_id);
                let removed_len = pending.inline_payload.as_ref().map_or(0, |p| p.len() as u64);
                inner.pending_data_length = inner.pending_data_length.saturating_sub(removed_len);
                return Ok(());
            }
        }

        match self.lookup(&inner, content_id) {
            None => Err(CoreErrorKind::BlockNotFound(key).into()),
            Some(info) if info.deleted => Ok(()),
            Some(_) => {
                inner.pending_by_id.remove(&key);
                inner
                    .pack_index_builder
                    .add(BlockInfo::tombstone(content_id.clone(), now));
                Ok(())
            }
        }
    }

    /// `RewriteBlock(content_id)` (§4.2): reads the current payload and re-submits it as a
    /// fresh pending entry, so it lands in a new pack under the current write format version
    /// regardless of what pack (or format version) it previously lived in.
    ///
    /// # Errors
    ///
    /// Propagates `get_block`'s errors and pack-write errors.
    pub fn rewrite_block(&self, content_id: &ContentId, cancel: &CancellationToken) -> CoreResult<()> {
        cancel.check()?;
        let data = self.get_block(content_id, cancel)?;
        let now = self.clock.now_seconds();

        let to_finish = {
            let mut inner = self.inner.lock().unwrap();
            let info = BlockInfo::new_pending(content_id.clone(), now, data.clone());
            inner.pending_data_length += data.len() as u64;
            inner
                .pending_by_id
                .insert(content_id.as_str().to_owned(), info.clone());
            inner.pack_index_builder.add(info);

            if inner.pending_data_length >= self.max_pack_size {
                Some(Self::snapshot_pending(&inner))
            } else {
                None
            }
        };

        if let Some(entries) = to_finish {
            self.finish_pending_pack(entries, cancel)?;
        }
        Ok(())
    }

    /// Assemble and write one pack blob from `entries` (a snapshot of `pending_by_id` taken
    /// while the manager mutex was held), then splice the result in. On a failed `PutBlob`,
    /// `pending_by_id`/`pack_index_builder` are left exactly as they were before the attempt
    /// started, so a later `WriteBlock`/`Flush` retries from scratch with a fresh pack id.
    fn finish_pending_pack(&self, entries: Vec<BlockInfo>, cancel: &CancellationToken) -> CoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = entries
            .iter()
            .map(|e| e.content_id.as_str().to_owned())
            .collect();

        let mut random = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut random);
        let pack_blob_id = format!("{PACK_BLOB_PREFIX}{}", hex::encode(random));

        let assembled = assemble_pack(
            entries,
            &self.repository_format_bytes,
            &self.formatter,
            self.layout,
            self.write_format_version,
        )?;
        let encrypted_bytes: u64 = assembled.local_index.values().map(|e| u64::from(e.length)).sum();
        self.stats.record_encrypt(encrypted_bytes);

        self.blob_store.put_blob(&pack_blob_id, &assembled.bytes, cancel)?;
        self.stats.record_write(assembled.bytes.len() as u64);
        if let Some(list_cache) = &self.list_cache {
            list_cache.delete_list_cache()?;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            for id in &ids {
                inner.pending_by_id.remove(id);
            }
            for mut info in assembled.local_index.values().cloned().collect::<Vec<_>>() {
                info.pack_blob_id = Some(pack_blob_id.clone());
                inner.pack_index_builder.add(info);
            }
            inner.pending_data_length = inner
                .pending_by_id
                .values()
                .map(|b| b.inline_payload.as_ref().map_or(0, |p| p.len() as u64))
                .sum();
        }

        let due = {
            let inner = self.inner.lock().unwrap();
            self.clock.now_seconds() > inner.flush_pack_indexes_after
        };
        if due {
            self.flush_index(cancel)?;
        }
        Ok(())
    }

    /// `Flush()` (§4.2): finalize any pending pack, then flush the pack-index builder into a
    /// fresh index blob. A no-op if there's neither pending data nor an unflushed builder.
    ///
    /// # Errors
    ///
    /// Propagates pack-write and index-write errors.
    pub fn flush(&self, cancel: &CancellationToken) -> CoreResult<()> {
        cancel.check()?;
        let entries = {
            let inner = self.inner.lock().unwrap();
            Self::snapshot_pending(&inner)
        };
        if !entries.is_empty() {
            self.finish_pending_pack(entries, cancel)?;
        }
        self.flush_index(cancel)
    }

    /// Flush `pack_index_builder` into a freshly-named index blob (§4.6 step: blob name and
    /// per-block encryption IV are both derived from `compute_id` of the plaintext, so the
    /// blob is entirely self-describing on read). A failed `PutBlob`, or a failed local
    /// registration afterward, restores the taken entries into `pack_index_builder` so a later
    /// `Flush` retries (§7).
    ///
    /// # Errors
    ///
    /// Propagates encode/encrypt/write errors.
    pub fn flush_index(&self, cancel: &CancellationToken) -> CoreResult<()> {
        cancel.check()?;
        let taken = {
            let mut inner = self.inner.lock().unwrap();
            if inner.disable_index_flush_count > 0 || inner.pack_index_builder.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut inner.pack_index_builder))
            }
        };
        let Some(builder) = taken else {
            let mut inner = self.inner.lock().unwrap();
            inner.flush_pack_indexes_after = self.clock.now_seconds() + FLUSH_INDEX_INTERVAL_SECONDS;
            return Ok(());
        };

        let result = self.try_flush_builder(&builder, cancel);
        if result.is_err() {
            let mut inner = self.inner.lock().unwrap();
            let mut restored = builder;
            std::mem::swap(&mut inner.pack_index_builder, &mut restored);
            inner.pack_index_builder.merge_from(restored);
        } else {
            let mut inner = self.inner.lock().unwrap();
            inner.flush_pack_indexes_after = self.clock.now_seconds() + FLUSH_INDEX_INTERVAL_SECONDS;
        }
        result
    }

    fn try_flush_builder(&self, builder: &PackIndexBuilder, cancel: &CancellationToken) -> CoreResult<()> {
        let bytes = builder.build()?;
        let iv = self.formatter.compute_id(&bytes);
        let ciphertext = self.formatter.encrypt(&bytes, &iv)?;
        let blob_id = format!("{INDEX_BLOB_PREFIX}{}", hex::encode(&iv));

        self.blob_store.put_blob(&blob_id, &ciphertext, cancel)?;
        if let Some(list_cache) = &self.list_cache {
            list_cache.delete_list_cache()?;
        }
        self.committed_index.add_block(&blob_id, &bytes, true)?;
        Ok(())
    }

    /// `ListBlocks(prefix)` (§4.2): live (non-deleted) content ids starting with `prefix`.
    #[must_use]
    pub fn list_blocks(&self, prefix: &str) -> Vec<ContentId> {
        self.list_block_infos(prefix, false)
            .into_iter()
            .map(|info| info.content_id)
            .collect()
    }

    /// `ListBlockInfos(prefix, include_deleted)` (§4.2): full metadata records, merged across
    /// pending state, the in-memory pack-index builder, and the committed index under I4.
    #[must_use]
    pub fn list_block_infos(&self, prefix: &str, include_deleted: bool) -> Vec<BlockInfo> {
        let mut by_id: HashMap<String, BlockInfo> = HashMap::new();
        {
            let inner = self.inner.lock().unwrap();
            for info in inner.pack_index_builder.values() {
                if info.content_id.starts_with(prefix) {
                    by_id.insert(info.content_id.as_str().to_owned(), info.clone());
                }
            }
            for info in inner.pending_by_id.values() {
                if info.content_id.starts_with(prefix) {
                    by_id.insert(info.content_id.as_str().to_owned(), info.clone());
                }
            }
        }
        for info in self.committed_index.snapshot().iterate_prefix(prefix) {
            match by_id.get(info.content_id.as_str()) {
                Some(existing) if !info.supersedes(existing) => {}
                _ => {
                    by_id.insert(info.content_id.as_str().to_owned(), info);
                }
            }
        }

        let mut out: Vec<BlockInfo> = by_id
            .into_values()
            .filter(|info| include_deleted || !info.deleted)
            .collect();
        out.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        out
    }

    fn list_index_blobs(&self, cancel: &CancellationToken) -> CoreResult<Vec<BlobMetadata>> {
        match &self.list_cache {
            Some(cache) => cache.list(self.blob_store.as_ref(), cancel),
            None => list_all_blobs_consistent(
                self.blob_store.as_ref(),
                INDEX_BLOB_PREFIX,
                LIST_CACHE_MAX_ATTEMPTS,
                cancel,
            ),
        }
    }

    /// `IndexBlocks()` (§4.2): the current listing of index blobs backing the committed index
    /// (via the List Cache when enabled).
    ///
    /// # Errors
    ///
    /// Propagates the underlying listing error.
    pub fn index_blocks(&self, cancel: &CancellationToken) -> CoreResult<Vec<BlobMetadata>> {
        self.list_index_blobs(cancel)
    }

    fn fetch_index_blob_with_retry(&self, blob_id: &str, cancel: &CancellationToken) -> CoreResult<Vec<u8>> {
        let suffix = blob_id.strip_prefix(INDEX_BLOB_PREFIX).unwrap_or(blob_id);
        let iv = hex::decode(suffix).map_err(|_| {
            CoreErrorKind::InvalidFormat(format!("index blob id {blob_id:?} is not valid hex"))
        })?;

        let mut delay = Duration::from_millis(BACKOFF_START_MS);
        let mut attempt = 0u32;
        loop {
            cancel.check()?;
            match self.blob_store.get_blob(blob_id, 0, None, cancel) {
                Ok(ciphertext) => return self.formatter.decrypt(&ciphertext, &iv),
                Err(err) if attempt < BACKOFF_MAX_ATTEMPTS && is_transient(&err) => {
                    warn!("retrying index blob {blob_id} fetch after transient error: {err}");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn load_pack_indexes(&self, progress: &impl Progress, cancel: &CancellationToken) -> CoreResult<bool> {
        let listing = self.list_index_blobs(cancel)?;
        let ids: Vec<String> = listing.into_iter().map(|b| b.id).collect();
        progress.set_title("loading index blobs");
        if !progress.is_hidden() {
            progress.set_length(ids.len() as u64);
        }
        let changed = self.committed_index.use_blobs(&ids, |blob_id| {
            let bytes = self.fetch_index_blob_with_retry(blob_id, cancel)?;
            progress.inc(1);
            Ok(bytes)
        })?;
        progress.finish();
        Ok(changed)
    }

    /// `Refresh()` (§4.2): re-list index blobs and reconcile the committed index against them.
    /// Returns whether the active set actually changed.
    ///
    /// # Errors
    ///
    /// Propagates listing and index-blob fetch/decrypt errors.
    pub fn refresh(&self, progress: &impl Progress, cancel: &CancellationToken) -> CoreResult<bool> {
        self.load_pack_indexes(progress, cancel)
    }

    /// `FindUnreferencedBlobs()` (§4.2): pack blobs with no live reference from the pack-index
    /// builder or the committed index. Does not consider pending (not-yet-packed) entries,
    /// since those reference no pack blob yet.
    ///
    /// # Errors
    ///
    /// Propagates the underlying listing error.
    pub fn find_unreferenced_blobs(&self, cancel: &CancellationToken) -> CoreResult<Vec<BlobMetadata>> {
        let mut referenced: HashSet<String> = HashSet::new();
        {
            let inner = self.inner.lock().unwrap();
            for info in inner.pack_index_builder.values() {
                if let Some(id) = &info.pack_blob_id {
                    referenced.insert(id.clone());
                }
            }
        }
        for info in self.committed_index.snapshot().iterate_prefix("") {
            if let Some(id) = &info.pack_blob_id {
                referenced.insert(id.clone());
            }
        }

        let mut unreferenced = Vec::new();
        self.blob_store.list_blobs(PACK_BLOB_PREFIX, cancel, &mut |meta| {
            if !referenced.contains(&meta.id) {
                unreferenced.push(meta);
            }
            Ok(())
        })?;
        Ok(unreferenced)
    }

    /// `DisableIndexFlush()` (§4.2): suppress `Flush`'s automatic index-blob write. Calls
    /// nest; pair every call with `enable_index_flush`.
    pub fn disable_index_flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disable_index_flush_count += 1;
    }

    /// `EnableIndexFlush()` (§4.2): undo one `disable_index_flush` call.
    pub fn enable_index_flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disable_index_flush_count = inner.disable_index_flush_count.saturating_sub(1);
    }

    /// `CompactIndexes(options)` (§4.8): fold several small index blobs into one. Selection:
    /// gather non-compacted index blobs at or under `max_pack_size` (or all, if
    /// `options.all_blobs`); do nothing below `options.min_small_blobs`; cap the batch at
    /// `options.max_small_blobs`; if "very small" (< `max_pack_size`/20) blobs are more than
    /// half the batch and collapsing just those would already leave fewer than
    /// `min_small_blobs` blobs overall, compact only the very-small ones, otherwise compact the
    /// whole batch.
    ///
    /// # Errors
    ///
    /// Propagates listing, fetch, encode, and write errors.
    pub fn compact_indexes(
        &self,
        options: &CompactOptions,
        progress: &impl Progress,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        cancel.check()?;
        let mut candidates: Vec<BlobMetadata> = self
            .list_index_blobs(cancel)?
            .into_iter()
            .filter(|b| options.all_blobs || b.length <= self.max_pack_size)
            .collect();

        if candidates.len() < options.min_small_blobs {
            return Ok(());
        }
        candidates.sort_by_key(|b| b.length);
        if candidates.len() > options.max_small_blobs {
            candidates.truncate(options.max_small_blobs);
        }

        let very_small_threshold = self.max_pack_size / 20;
        let total = candidates.len();
        let very_small_count = candidates
            .iter()
            .filter(|b| b.length < very_small_threshold)
            .count();

        let to_compact: Vec<BlobMetadata> =
            if very_small_count * 2 > total && 1 + (total - very_small_count) < options.min_small_blobs {
                candidates
                    .into_iter()
                    .filter(|b| b.length < very_small_threshold)
                    .collect()
            } else {
                candidates
            };

        if to_compact.len() < 2 {
            return Ok(());
        }

        self.disable_index_flush();
        let result = self.run_compaction(&to_compact, options, progress, cancel);
        self.enable_index_flush();
        result
    }

    fn run_compaction(
        &self,
        candidates: &[BlobMetadata],
        options: &CompactOptions,
        progress: &impl Progress,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        progress.set_title("compacting index blobs");
        if !progress.is_hidden() {
            progress.set_length(candidates.len() as u64);
        }
        let mut merged = PackIndexBuilder::new();
        for candidate in candidates {
            cancel.check()?;
            let bytes = self.fetch_index_blob_with_retry(&candidate.id, cancel)?;
            progress.inc(1);
            let index = PackIndex::parse(bytes)?;
            for entry in index.iter() {
                if entry.deleted {
                    if let Some(skip_after) = options.skip_deleted_older_than {
                        let age = self.clock.now_seconds().saturating_sub(entry.timestamp_seconds);
                        if age > skip_after.as_secs() {
                            continue;
                        }
                    }
                }
                match merged.get(&entry.content_id) {
                    Some(existing) if !entry.supersedes(existing) => {}
                    _ => merged.add(entry),
                }
            }
        }

        let bytes = merged.build()?;
        let iv = self.formatter.compute_id(&bytes);
        let ciphertext = self.formatter.encrypt(&bytes, &iv)?;
        let new_blob_id = format!("{INDEX_BLOB_PREFIX}{}", hex::encode(&iv));

        self.blob_store.put_blob(&new_blob_id, &ciphertext, cancel)?;
        if let Some(list_cache) = &self.list_cache {
            list_cache.delete_list_cache()?;
        }
        self.committed_index.add_block(&new_blob_id, &bytes, true)?;

        for candidate in candidates {
            if candidate.id == new_blob_id {
                continue;
            }
            if let Err(err) = self.blob_store.delete_blob(&candidate.id, cancel) {
                warn!(
                    "compaction: failed to delete superseded index blob {}: {err}",
                    candidate.id
                );
            }
        }
        if let Some(list_cache) = &self.list_cache {
            list_cache.delete_list_cache()?;
        }

        progress.finish();
        self.load_pack_indexes(progress, cancel)?;
        Ok(())
    }

    /// `RecoverIndexFromPackBlob(pack_blob_id, length, commit)` (§4.9): fetch a pack blob whose
    /// record has been lost (e.g. an index blob was never written or was corrupted), decrypt
    /// its postamble-described local index, and optionally splice the recovered entries into
    /// `pack_index_builder` so the next `Flush` commits them.
    ///
    /// # Errors
    ///
    /// Propagates fetch and postamble-decode errors.
    pub fn recover_index_from_pack_blob(
        &self,
        pack_blob_id: &str,
        length: u64,
        commit: bool,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<BlockInfo>> {
        cancel.check()?;
        let bytes = self.blob_store.get_blob(pack_blob_id, 0, Some(length), cancel)?;
        let recovered = recover_local_index(&bytes, &self.formatter)?;
        let entries: Vec<BlockInfo> = recovered
            .iter()
            .map(|mut entry| {
                entry.pack_blob_id = Some(pack_blob_id.to_owned());
                entry
            })
            .collect();

        if commit {
            let mut inner = self.inner.lock().unwrap();
            for entry in entries.clone() {
                inner.pack_index_builder.add(entry);
            }
        }
        Ok(entries)
    }

    /// Batch form of [`Self::recover_index_from_pack_blob`] (§4.9, §10.5): lists every pack
    /// blob and recovers each one's local index in turn, reporting `progress` as it goes. Used
    /// after catastrophic index loss, when there is no committed index left to consult for
    /// which pack blobs exist.
    ///
    /// # Errors
    ///
    /// Propagates listing, fetch, and postamble-decode errors.
    pub fn recover_all_indexes(
        &self,
        commit: bool,
        progress: &impl Progress,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<BlockInfo>> {
        let mut packs = Vec::new();
        self.blob_store.list_blobs(PACK_BLOB_PREFIX, cancel, &mut |meta| {
            packs.push(meta);
            Ok(())
        })?;

        progress.set_title("recovering indexes from pack blobs");
        if !progress.is_hidden() {
            progress.set_length(packs.len() as u64);
        }
        let mut recovered = Vec::new();
        for pack in packs {
            cancel.check()?;
            recovered.extend(self.recover_index_from_pack_blob(&pack.id, pack.length, commit, cancel)?);
            progress.inc(1);
        }
        progress.finish();
        Ok(recovered)
    }

    /// Panics with a diagnostic if `invariant_check` is enabled and I1-I4 (§8) don't hold over
    /// the current pending/builder state. Intended to be called after a mutating operation
    /// completes, never on the hot read path.
    #[cfg(test)]
    fn check_invariants(&self) {
        if !self.invariant_check {
            return;
        }
        let inner = self.inner.lock().unwrap();
        for (key, pending) in &inner.pending_by_id {
            let in_builder = inner.pack_index_builder.get(&pending.content_id);
            assert!(
                in_builder.is_some_and(|b| b == pending),
                "I2 violated: pending entry {key} missing or diverged in pack_index_builder"
            );
        }
        for info in inner.pack_index_builder.values() {
            if !inner.pending_by_id.contains_key(info.content_id.as_str()) && !info.deleted {
                assert!(
                    info.pack_blob_id.is_some(),
                    "I3 violated: packed, non-deleted entry {} has no pack_blob_id",
                    info.content_id
                );
            }
        }
    }
}

/// Mirrors the teacher's one `Drop` impl (`rclone::ChildToKill`, which kills a spawned child
/// process on drop): a manager dropped without an explicit `close()` call still stops its
/// background sweeper rather than leaking the thread.
impl Drop for BlockManager {
    fn drop(&mut self) {
        self.close();
    }
}
