//! Pack blob assembly (§3, §4.5) and the self-describing recovery postamble (§3, §4.9).
//!
//! Grounded in the teacher's `repofile::packfile` binary-framing idiom (a small struct with
//! `from_binary`/`to_binary` wrapping a `Cursor`), generalized off `binrw`'s fixed-width
//! derive macros since the postamble's fields are varint-encoded rather than fixed-width.

use rand::RngCore;

use crate::error::{CoreResult, PackErrorKind};
use crate::index::builder::PackIndexBuilder;
use crate::index::record::BlockInfo;

/// Pack blobs are padded to a multiple of this many bytes by default (§4.5 step 5).
pub const DEFAULT_PADDING_UNIT: usize = 4096;
/// Default bounds for the random preamble length (§4.5 step 3).
pub const DEFAULT_MIN_PREAMBLE_LEN: usize = 32;
pub const DEFAULT_MAX_PREAMBLE_LEN: usize = 32;

const POSTAMBLE_FLAG: u64 = 1;

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> CoreResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or(PackErrorKind::InvalidPostambleLength(0))?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(PackErrorKind::InvalidPostambleLength(0).into());
        }
    }
}

/// The decoded postamble fields (§3): where the encrypted local index lives within the pack
/// and the IV it was encrypted with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Postamble {
    pub iv: Vec<u8>,
    pub local_index_offset: u64,
    pub local_index_length: u64,
}

impl Postamble {
    /// Encode `{flag=1, iv_len, iv_bytes, local_index_offset, local_index_length}` followed by
    /// a CRC-32 (IEEE) of those bytes, followed by a trailing length byte.
    ///
    /// # Errors
    ///
    /// Returns [`PackErrorKind::PostambleTooLarge`] if the encoded postamble (excluding the
    /// trailing length byte) would not fit in one byte, since §3 requires the length to be
    /// self-describing from a single trailing byte.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut fields = Vec::new();
        write_varint(&mut fields, POSTAMBLE_FLAG);
        write_varint(&mut fields, self.iv.len() as u64);
        fields.extend_from_slice(&self.iv);
        write_varint(&mut fields, self.local_index_offset);
        write_varint(&mut fields, self.local_index_length);

        let crc = crc32fast::hash(&fields);
        fields.extend_from_slice(&crc.to_be_bytes());

        let len = u8::try_from(fields.len()).map_err(|_| PackErrorKind::PostambleTooLarge)?;
        fields.push(len);
        Ok(fields)
    }

    /// Scan backwards from the end of `pack`: the last byte is the postamble length; the
    /// region immediately before it is CRC-checked and decoded.
    ///
    /// # Errors
    ///
    /// [`PackErrorKind::PackTooShortForPostamble`], [`PackErrorKind::InvalidPostambleLength`],
    /// [`PackErrorKind::PostambleCrcMismatch`], or [`PackErrorKind::UnknownPostambleFlag`].
    pub fn decode_from_pack(pack: &[u8]) -> CoreResult<Self> {
        let len = *pack.last().ok_or(PackErrorKind::PackTooShortForPostamble)? as usize;
        if len < 5 || pack.len() < len + 1 {
            return Err(PackErrorKind::InvalidPostambleLength(len as u8).into());
        }
        let body_start = pack.len() - 1 - len;
        let body = &pack[body_start..pack.len() - 1];
        let (fields, crc_bytes) = body.split_at(body.len() - 4);
        let expected = u32::from_be_bytes(crc_bytes.try_into().expect("4 bytes"));
        let computed = crc32fast::hash(fields);
        if expected != computed {
            return Err(PackErrorKind::PostambleCrcMismatch { expected, computed }.into());
        }

        let mut pos = 0usize;
        let flag = read_varint(fields, &mut pos)?;
        if flag != POSTAMBLE_FLAG {
            return Err(PackErrorKind::UnknownPostambleFlag(flag as u8).into());
        }
        let iv_len = read_varint(fields, &mut pos)? as usize;
        let iv = fields
            .get(pos..pos + iv_len)
            .ok_or(PackErrorKind::InvalidPostambleLength(iv_len as u8))?
            .to_vec();
        pos += iv_len;
        let local_index_offset = read_varint(fields, &mut pos)?;
        let local_index_length = read_varint(fields, &mut pos)?;

        Ok(Self {
            iv,
            local_index_offset,
            local_index_length,
        })
    }
}

/// Options governing pack assembly; defaults match §4.5.
#[derive(Debug, Clone, Copy)]
pub struct PackLayout {
    pub min_preamble_len: usize,
    pub max_preamble_len: usize,
    pub padding_unit: usize,
}

impl Default for PackLayout {
    fn default() -> Self {
        Self {
            min_preamble_len: DEFAULT_MIN_PREAMBLE_LEN,
            max_preamble_len: DEFAULT_MAX_PREAMBLE_LEN,
            padding_unit: DEFAULT_PADDING_UNIT,
        }
    }
}

/// The result of assembling one pack blob: its bytes, ready for `PutBlob`, and the per-pack
/// index recording each block's final `pack_offset`/`length` within it.
pub struct AssembledPack {
    pub bytes: Vec<u8>,
    pub local_index: PackIndexBuilder,
}

/// Assemble a pack blob from pending entries (§4.5 steps 2-7). Each entry's `inline_payload`
/// is consumed; the returned `BlockInfo`s (via `local_index`) carry the post-encryption
/// `pack_offset`/`length` and `pack_blob_id` left `None` (the caller fills it in once the
/// blob's name is chosen, since naming depends on 16 random bytes chosen independently of
/// pack layout).
///
/// # Errors
///
/// Propagates [`crate::crypto::Formatter`] errors and [`PackErrorKind::PostambleTooLarge`].
pub fn assemble_pack(
    entries: Vec<BlockInfo>,
    repository_format_bytes: &[u8],
    formatter: &crate::crypto::Formatter,
    layout: PackLayout,
    write_format_version: u8,
) -> CoreResult<AssembledPack> {
    let mut rng = rand::thread_rng();
    let mut out = Vec::new();
    out.extend_from_slice(repository_format_bytes);

    let preamble_len = if layout.max_preamble_len > layout.min_preamble_len {
        layout.min_preamble_len
            + (rng.next_u32() as usize) % (layout.max_preamble_len - layout.min_preamble_len + 1)
    } else {
        layout.min_preamble_len
    };
    let mut preamble = vec![0u8; preamble_len];
    rng.fill_bytes(&mut preamble);
    out.extend_from_slice(&preamble);

    let mut local_index = PackIndexBuilder::new();
    for mut entry in entries {
        let payload = entry.inline_payload.take().unwrap_or_default();
        let stored = if write_format_version >= 1 {
            let iv = content_id_iv(&entry.content_id);
            formatter.encrypt(&payload, &iv)?
        } else {
            payload
        };
        entry.pack_offset = u32::try_from(out.len())
            .map_err(|_| PackErrorKind::LocalIndexOutOfBounds)?;
        entry.length = u32::try_from(stored.len())
            .map_err(|_| PackErrorKind::LocalIndexOutOfBounds)?;
        entry.format_version = write_format_version;
        out.extend_from_slice(&stored);
        local_index.add(entry);
    }

    if layout.padding_unit > 0 {
        let remainder = out.len() % layout.padding_unit;
        if remainder != 0 {
            let pad_len = layout.padding_unit - remainder;
            let mut pad = vec![0u8; pad_len];
            rng.fill_bytes(&mut pad);
            out.extend_from_slice(&pad);
        }
    }

    let local_index_bytes = local_index.build()?;
    let iv = formatter.compute_id(&local_index_bytes);
    let local_index_ciphertext = formatter.encrypt(&local_index_bytes, &iv)?;
    let local_index_offset = out.len() as u64;
    let local_index_length = local_index_ciphertext.len() as u64;
    out.extend_from_slice(&local_index_ciphertext);

    let postamble = Postamble {
        iv,
        local_index_offset,
        local_index_length,
    };
    out.extend_from_slice(&postamble.encode()?);

    Ok(AssembledPack {
        bytes: out,
        local_index,
    })
}

/// Derive the per-block encryption IV from the last 16 bytes of the content id's decoded hash
/// (§4.5 step 4).
pub(crate) fn content_id_iv(content_id: &crate::id::ContentId) -> Vec<u8> {
    let hash = content_id.hash_bytes();
    let start = hash.len().saturating_sub(16);
    hash[start..].to_vec()
}

/// Recover a pack's local index (§4.9): locate and decrypt the postamble-described region,
/// returning the parsed [`crate::index::format::PackIndex`].
///
/// # Errors
///
/// Propagates [`Postamble::decode_from_pack`] and [`crate::crypto::Formatter::decrypt`] errors.
pub fn recover_local_index(
    pack: &[u8],
    formatter: &crate::crypto::Formatter,
) -> CoreResult<crate::index::format::PackIndex> {
    let postamble = Postamble::decode_from_pack(pack)?;
    let start = postamble.local_index_offset as usize;
    let end = start + postamble.local_index_length as usize;
    let ciphertext = pack
        .get(start..end)
        .ok_or(PackErrorKind::LocalIndexOutOfBounds)?;
    let plaintext = formatter.decrypt(ciphertext, &postamble.iv)?;
    crate::index::format::PackIndex::parse(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postamble_round_trips() {
        let p = Postamble {
            iv: vec![1, 2, 3, 4, 5, 6, 7, 8],
            local_index_offset: 4096,
            local_index_length: 128,
        };
        let mut pack = vec![0u8; 100];
        pack.extend_from_slice(&p.encode().unwrap());
        let decoded = Postamble::decode_from_pack(&pack).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn rejects_too_short_pack() {
        assert!(Postamble::decode_from_pack(&[]).is_err());
        assert!(Postamble::decode_from_pack(&[3]).is_err());
    }

    #[test]
    fn rejects_corrupted_crc() {
        let p = Postamble {
            iv: vec![0; 16],
            local_index_offset: 10,
            local_index_length: 20,
        };
        let mut encoded = p.encode().unwrap();
        let n = encoded.len();
        encoded[n - 2] ^= 0xff;
        assert!(Postamble::decode_from_pack(&encoded).is_err());
    }

    #[test]
    fn assembles_and_recovers_a_pack() {
        use crate::crypto::Formatter;
        use crate::id::ContentId;

        let formatter = Formatter::new("HMAC-SHA256", "NONE", b"secret", b"").unwrap();
        let id1 = ContentId::new(Some('g'), &formatter.compute_id(b"one")).unwrap();
        let id2 = ContentId::new(Some('g'), &formatter.compute_id(b"two")).unwrap();
        let entries = vec![
            BlockInfo::new_pending(id1.clone(), 1, b"one".to_vec()),
            BlockInfo::new_pending(id2.clone(), 2, b"two".to_vec()),
        ];
        let assembled = assemble_pack(entries, b"fmt", &formatter, PackLayout::default(), 0).unwrap();

        let recovered = recover_local_index(&assembled.bytes, &formatter).unwrap();
        assert!(recovered.get(&id1).is_some());
        assert!(recovered.get(&id2).is_some());
    }
}
