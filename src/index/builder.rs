//! Pack-Index Builder (§4.3): a mutable `content_id -> BlockInfo` map, serialized into the
//! binary pack-index format on `build`.

use std::collections::HashMap;

use crate::error::CoreResult;
use crate::id::ContentId;
use crate::index::format;
use crate::index::record::BlockInfo;

#[derive(Debug, Default, Clone)]
pub struct PackIndexBuilder {
    entries: HashMap<String, BlockInfo>,
}

impl PackIndexBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `Add(info)` overwrites any existing entry for the same content id.
    pub fn add(&mut self, info: BlockInfo) {
        self.entries.insert(info.content_id.as_str().to_owned(), info);
    }

    #[must_use]
    pub fn get(&self, content_id: &ContentId) -> Option<&BlockInfo> {
        self.entries.get(content_id.as_str())
    }

    pub fn remove(&mut self, content_id: &ContentId) -> Option<BlockInfo> {
        self.entries.remove(content_id.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &BlockInfo> {
        self.entries.values()
    }

    /// Merge another builder's entries into this one, applying I4 (newest timestamp, then
    /// non-deleted-preferred) per key where both sides hold a record.
    pub fn merge_from(&mut self, other: Self) {
        for (key, info) in other.entries {
            match self.entries.get(&key) {
                Some(existing) if !info.supersedes(existing) => {}
                _ => {
                    self.entries.insert(key, info);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// `Build(writer)`: emit the serialized pack-index format (§3).
    ///
    /// # Errors
    ///
    /// Propagates [`format::encode`]'s errors.
    pub fn build(&self) -> CoreResult<Vec<u8>> {
        let entries: Vec<BlockInfo> = self.entries.values().cloned().collect();
        format::encode(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_overwrites_existing_entry() {
        let id = ContentId::new(Some('g'), &[1, 2]).unwrap();
        let mut b = PackIndexBuilder::new();
        b.add(BlockInfo::tombstone(id.clone(), 10));
        b.add(BlockInfo::new_pending(id.clone(), 20, vec![1, 2, 3]));
        assert_eq!(b.len(), 1);
        assert!(!b.get(&id).unwrap().deleted);
    }

    #[test]
    fn merge_applies_i4_tiebreak() {
        let id = ContentId::new(Some('g'), &[1]).unwrap();
        let mut a = PackIndexBuilder::new();
        a.add(BlockInfo::tombstone(id.clone(), 100));
        let mut b = PackIndexBuilder::new();
        b.add(BlockInfo::new_pending(id.clone(), 100, vec![9]));
        a.merge_from(b);
        assert!(!a.get(&id).unwrap().deleted);
    }
}
