//! Binary pack-index format (§3, §4.3): an 8-byte header, `entry_count` fixed-stride
//! records sorted by content id, and a variable-length tail of pack-blob id strings
//! referenced by offset/length from the records.
//!
//! Grounded in the teacher's `repofile::packfile` binary-encoding idiom (fixed binary
//! headers read/written through a `Cursor`), generalized from binrw's static-layout
//! structures to this format's variable key width, which is only known once the widest
//! content id in a given index has been observed.

use std::collections::HashMap;
use std::convert::TryFrom;

use bytes::Bytes;

use crate::error::{CoreResult, IndexErrorKind};
use crate::id::ContentId;
use crate::index::record::BlockInfo;

pub const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 8;
const VALUE_LEN: usize = 24;
const NO_TAIL_REF: u32 = u32::MAX;

/// Encode a set of (already-deduplicated) [`BlockInfo`] entries into the on-disk pack-index
/// byte format.
///
/// # Errors
///
/// Returns [`IndexErrorKind::FieldOutOfRange`] if any field doesn't fit its encoded width
/// (the format never silently truncates, per SPEC_FULL.md's Open Question decision), or
/// [`IndexErrorKind::ContentIdTooWide`] if content ids in the set have inconsistent raw
/// widths (more than the one-byte prefix/no-prefix difference the format tolerates).
pub fn encode(entries: &[BlockInfo]) -> CoreResult<Vec<u8>> {
    let mut sorted: Vec<&BlockInfo> = entries.iter().collect();
    let key_size = sorted
        .iter()
        .map(|e| e.content_id.raw_bytes().len())
        .max()
        .unwrap_or(0);
    sorted.sort_by_cached_key(|e| encode_key(e.content_id.raw_bytes(), key_size).unwrap_or_default());

    let entry_count = u32::try_from(sorted.len())
        .map_err(|_| IndexErrorKind::FieldOutOfRange(format!("entry_count {}", sorted.len())))?;

    let mut tail = Vec::new();
    let mut tail_refs: HashMap<String, (u32, u16)> = HashMap::new();
    let mut records = Vec::with_capacity(sorted.len() * (key_size + VALUE_LEN));

    for entry in &sorted {
        records.extend_from_slice(&encode_key(entry.content_id.raw_bytes(), key_size)?);
        records.push(u8::from(entry.deleted));
        records.push(entry.format_version);
        records.extend_from_slice(&entry.pack_offset.to_be_bytes());
        records.extend_from_slice(&entry.length.to_be_bytes());
        records.extend_from_slice(&entry.timestamp_seconds.to_be_bytes());

        match &entry.pack_blob_id {
            None => {
                records.extend_from_slice(&NO_TAIL_REF.to_be_bytes());
                records.extend_from_slice(&0u16.to_be_bytes());
            }
            Some(blob_id) => {
                let (offset, len) = *tail_refs.entry(blob_id.clone()).or_insert_with(|| {
                    let offset = u32::try_from(tail.len()).expect("tail fits in u32");
                    tail.extend_from_slice(blob_id.as_bytes());
                    let len = u16::try_from(blob_id.len()).expect("blob ids are short ascii strings");
                    (offset, len)
                });
                records.extend_from_slice(&offset.to_be_bytes());
                records.extend_from_slice(&len.to_be_bytes());
            }
        }
    }

    let value_size = u16::try_from(VALUE_LEN).expect("VALUE_LEN is a small constant");
    let key_size_u8 =
        u8::try_from(key_size).map_err(|_| IndexErrorKind::FieldOutOfRange(format!("key_size {key_size}")))?;

    let mut out = Vec::with_capacity(HEADER_LEN + records.len() + tail.len());
    out.push(FORMAT_VERSION);
    out.push(key_size_u8);
    out.extend_from_slice(&value_size.to_be_bytes());
    out.extend_from_slice(&entry_count.to_be_bytes());
    out.extend_from_slice(&records);
    out.extend_from_slice(&tail);
    Ok(out)
}

/// Normalize a content id's raw bytes to exactly `key_size` bytes using the
/// prefix-in-designated-slot convention (§4.3): byte 0 holds the prefix character, or `0x00`
/// if the entry has no prefix; the remaining `key_size - 1` bytes hold the hash.
fn encode_key(raw: Vec<u8>, key_size: usize) -> CoreResult<Vec<u8>> {
    if raw.len() == key_size {
        return Ok(raw);
    }
    if key_size > 0 && raw.len() == key_size - 1 {
        let mut out = Vec::with_capacity(key_size);
        out.push(0u8);
        out.extend_from_slice(&raw);
        return Ok(out);
    }
    Err(IndexErrorKind::ContentIdTooWide(format!(
        "raw content id of {} bytes does not fit index key_size {key_size}",
        raw.len()
    ))
    .into())
}

fn decode_key(key: &[u8]) -> ContentId {
    let prefix_byte = key[0];
    let hash = &key[1..];
    let prefix = if prefix_byte == 0 {
        None
    } else {
        Some(prefix_byte as char)
    };
    ContentId::new(prefix, hash).expect("prefix byte was validated at encode time")
}

/// A decoded, random-access view over one pack-index blob's bytes.
#[derive(Clone)]
pub struct PackIndex {
    bytes: Bytes,
    key_size: usize,
    value_size: usize,
    entry_count: u32,
}

impl PackIndex {
    /// Parse the header and validate structural consistency; does not decode any records
    /// eagerly (records are decoded on demand by [`PackIndex::get`] / [`PackIndex::iter`]).
    ///
    /// # Errors
    ///
    /// Returns [`IndexErrorKind::TruncatedHeader`], [`IndexErrorKind::UnsupportedVersion`], or
    /// [`IndexErrorKind::EntryCountMismatch`] on structural inconsistency.
    pub fn parse(bytes: impl Into<Bytes>) -> CoreResult<Self> {
        let bytes = bytes.into();
        if bytes.len() < HEADER_LEN {
            return Err(IndexErrorKind::TruncatedHeader.into());
        }
        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(IndexErrorKind::UnsupportedVersion(u16::from(version)).into());
        }
        let key_size = bytes[1] as usize;
        let value_size = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let entry_count = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let stride = key_size + value_size;
        let needed = HEADER_LEN + stride * entry_count as usize;
        if bytes.len() < needed {
            return Err(IndexErrorKind::EntryCountMismatch {
                declared: entry_count,
                stride,
            }
            .into());
        }

        Ok(Self {
            bytes,
            key_size,
            value_size,
            entry_count,
        })
    }

    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    fn stride(&self) -> usize {
        self.key_size + self.value_size
    }

    fn record_at(&self, index: usize) -> BlockInfo {
        let start = HEADER_LEN + index * self.stride();
        let key = &self.bytes[start..start + self.key_size];
        let value = &self.bytes[start + self.key_size..start + self.stride()];

        let content_id = decode_key(key);
        let deleted = value[0] != 0;
        let format_version = value[1];
        let pack_offset = u32::from_be_bytes(value[2..6].try_into().unwrap());
        let length = u32::from_be_bytes(value[6..10].try_into().unwrap());
        let timestamp_seconds = u64::from_be_bytes(value[10..18].try_into().unwrap());
        let tail_offset = u32::from_be_bytes(value[18..22].try_into().unwrap());
        let tail_len = u16::from_be_bytes(value[22..24].try_into().unwrap());

        let pack_blob_id = if tail_offset == NO_TAIL_REF {
            None
        } else {
            let tail_start = HEADER_LEN + self.stride() * self.entry_count as usize;
            let start = tail_start + tail_offset as usize;
            let end = start + tail_len as usize;
            Some(String::from_utf8_lossy(&self.bytes[start..end]).into_owned())
        };

        BlockInfo {
            content_id,
            length,
            timestamp_seconds,
            pack_blob_id,
            pack_offset,
            deleted,
            format_version,
            inline_payload: None,
        }
    }

    /// Binary search by the normalized key bytes (`find_entry_position` in §4.3).
    #[must_use]
    pub fn get(&self, content_id: &ContentId) -> Option<BlockInfo> {
        let target = encode_key(content_id.raw_bytes(), self.key_size).ok()?;
        let mut lo = 0usize;
        let mut hi = self.entry_count as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let start = HEADER_LEN + mid * self.stride();
            let key = &self.bytes[start..start + self.key_size];
            match key.cmp(target.as_slice()) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(self.record_at(mid)),
            }
        }
        None
    }

    /// Iterate all records in ascending content-id order.
    pub fn iter(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        (0..self.entry_count as usize).map(move |i| self.record_at(i))
    }
}
