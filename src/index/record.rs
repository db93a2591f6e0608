//! `BlockInfo`: per-block metadata (§3).

use crate::id::ContentId;

/// Per-block metadata tracked by the pending pack, the pack-index builder, and every
/// committed pack index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub content_id: ContentId,
    /// Bytes of stored (post-encryption) payload within the pack. Meaningless for a
    /// tombstone-only record.
    pub length: u32,
    /// Creation time, or time of most recent deletion, in unix seconds.
    pub timestamp_seconds: u64,
    /// Which pack blob holds the payload; `None` for a tombstone that was never
    /// materialized into a pack (deleted while still pending) or has been compacted away.
    pub pack_blob_id: Option<String>,
    pub pack_offset: u32,
    pub deleted: bool,
    pub format_version: u8,
    /// Only populated while the block is still in the pending pack, before it is written.
    pub inline_payload: Option<Vec<u8>>,
}

impl BlockInfo {
    #[must_use]
    pub fn new_pending(content_id: ContentId, timestamp_seconds: u64, payload: Vec<u8>) -> Self {
        Self {
            content_id,
            length: payload.len() as u32,
            timestamp_seconds,
            pack_blob_id: None,
            pack_offset: 0,
            deleted: false,
            format_version: 0,
            inline_payload: Some(payload),
        }
    }

    #[must_use]
    pub fn tombstone(content_id: ContentId, timestamp_seconds: u64) -> Self {
        Self {
            content_id,
            length: 0,
            timestamp_seconds,
            pack_blob_id: None,
            pack_offset: 0,
            deleted: true,
            format_version: 0,
            inline_payload: None,
        }
    }

    /// I4: when two records describe the same `content_id`, the one with the larger
    /// timestamp wins; ties prefer the non-deleted record.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        match self.timestamp_seconds.cmp(&other.timestamp_seconds) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => !self.deleted && other.deleted,
        }
    }
}
