//! Content identifiers.
//!
//! Unlike the teacher's fixed 32-byte `Id`, a [`ContentId`] is variable-width (the hash
//! algorithm registered with the [`crate::crypto::Formatter`] governs its length) and may
//! carry a single client-chosen prefix letter.

use std::fmt;

use derive_more::Display;

use crate::error::{CoreErrorKind, CoreResult};

/// Reserved prefixes `a`..=`f` are used internally; clients may only request `g`..=`z`.
pub const CLIENT_PREFIX_RANGE: std::ops::RangeInclusive<char> = 'g'..='z';

/// `content_id = prefix || hex(hash(data))`.
///
/// Equality and ordering are defined on the normalized raw bytes (see
/// [`ContentId::raw_bytes`]), not on the display string, so that content ids sort the same
/// way the pack-index format requires.
#[derive(Clone, Display, PartialEq, Eq, Hash)]
#[display(fmt = "{text}")]
pub struct ContentId {
    prefix: Option<char>,
    hash_hex: String,
    text: String,
}

impl ContentId {
    /// Build a `ContentId` from an optional client prefix and the raw hash bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreErrorKind::InvalidPrefix`] if `prefix` is `Some` and outside `g..=z`.
    pub fn new(prefix: Option<char>, hash: &[u8]) -> CoreResult<Self> {
        if let Some(p) = prefix {
            if !CLIENT_PREFIX_RANGE.contains(&p) {
                return Err(CoreErrorKind::InvalidPrefix(p).into());
            }
        }
        let hash_hex = hex::encode(hash);
        let text = match prefix {
            Some(p) => format!("{p}{hash_hex}"),
            None => hash_hex.clone(),
        };
        Ok(Self {
            prefix,
            hash_hex,
            text,
        })
    }

    /// Parse a `ContentId` from its display text (`[prefix]hex...`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreErrorKind::InvalidFormat`] if the text is not a valid hex string with an
    /// optional leading `g..=z` prefix, or decodes to an odd number of hex digits.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let mut chars = text.chars();
        let (prefix, hash_hex) = match chars.next() {
            Some(c) if CLIENT_PREFIX_RANGE.contains(&c) => (Some(c), chars.as_str().to_owned()),
            Some(c) if c.is_ascii_hexdigit() => (None, text.to_owned()),
            _ => {
                return Err(CoreErrorKind::InvalidFormat(format!(
                    "content id {text:?} has an invalid leading character"
                ))
                .into())
            }
        };
        if hash_hex.is_empty() || !hash_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreErrorKind::InvalidFormat(format!(
                "content id {text:?} does not decode to a valid hex hash"
            ))
            .into());
        }
        Ok(Self {
            prefix,
            hash_hex,
            text: text.to_owned(),
        })
    }

    #[must_use]
    pub fn prefix(&self) -> Option<char> {
        self.prefix
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn hash_hex(&self) -> &str {
        &self.hash_hex
    }

    /// Decoded hash bytes (without the prefix).
    #[must_use]
    pub fn hash_bytes(&self) -> Vec<u8> {
        hex::decode(&self.hash_hex).expect("hash_hex is validated hex on construction")
    }

    /// Normalized raw byte form used for sorting and the pack-index key encoding:
    /// the prefix byte (if any) followed by the decoded hash bytes.
    #[must_use]
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.hash_hex.len() / 2 + 1);
        if let Some(p) = self.prefix {
            out.push(p as u8);
        }
        out.extend(self.hash_bytes());
        out
    }

    #[must_use]
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.text.starts_with(prefix)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.text)
    }
}

impl PartialOrd for ContentId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw_bytes().cmp(&other.raw_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_round_trips_through_display_and_parse() {
        let id = ContentId::new(Some('k'), &[0xAB, 0xCD]).unwrap();
        assert_eq!(id.as_str(), "kabcd");
        let parsed = ContentId::parse("kabcd").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_reserved_prefix() {
        assert!(ContentId::new(Some('a'), &[0x01]).is_err());
    }

    #[test]
    fn raw_bytes_sort_unprefixed_before_prefixed() {
        let unprefixed = ContentId::new(None, &[0xFF]).unwrap();
        let prefixed = ContentId::new(Some('g'), &[0x00]).unwrap();
        assert!(unprefixed.raw_bytes() < prefixed.raw_bytes());
    }
}
