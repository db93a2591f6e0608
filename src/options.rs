//! The configuration surface (§6, §10.3): `FormattingOptions` and `CachingOptions`.
//!
//! Grounded in the teacher's `repository::RepositoryOptions`: plain structs built with
//! `derive_setters::Setters` for fluent `.field(value)` construction, `Clone + Debug` plus
//! `serde::{Serialize, Deserialize}` so a host application can round-trip them through its own
//! config file. The CLI-only conditional derives (`clap`, `merge`) are dropped since this
//! crate carries no CLI surface.

use derive_setters::Setters;

/// Hashing/encryption algorithm selection and pack-sizing knobs (§4.1, §4.5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case")]
#[setters(into, strip_option)]
pub struct FormattingOptions {
    /// Repository format version; governs per-block encryption discipline (§3).
    pub version: u8,
    /// Registered hash algorithm name (§4.1).
    pub hash: String,
    /// Registered encryption algorithm name (§4.1).
    pub encryption: String,
    /// HMAC secret for keyed hash algorithms.
    #[serde(with = "hex_bytes")]
    pub hmac_secret: Vec<u8>,
    /// Master key for encrypted schemes; must be at least
    /// [`crate::crypto::MIN_MASTER_KEY_LEN`] bytes.
    #[serde(with = "hex_bytes")]
    pub master_key: Vec<u8>,
    /// Pack blobs are finalized once pending inline payload bytes reach this threshold
    /// (§4.2, §4.5).
    pub max_pack_size: u64,
}

impl Default for FormattingOptions {
    fn default() -> Self {
        Self {
            version: 1,
            hash: "HMAC-SHA256-128".to_owned(),
            encryption: "ENCRYPTED_HMAC_SHA256_AES256_SIV".to_owned(),
            hmac_secret: Vec::new(),
            master_key: Vec::new(),
            max_pack_size: 32 << 20,
        }
    }
}

/// Local caching knobs for the Block Cache and List Cache (§4.6, §4.7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case")]
#[setters(into, strip_option)]
pub struct CachingOptions {
    /// Directory backing the disk Block Cache; empty disables it.
    pub cache_directory: String,
    /// Directory backing the on-disk Committed-Index Cache; empty uses the in-memory variant.
    pub index_cache_directory: String,
    /// Upper bound on the Block Cache's total retained size.
    pub max_cache_size_bytes: u64,
    /// How long a List Cache snapshot is trusted before a fresh listing is required.
    pub max_list_cache_duration_sec: u64,
    /// Force a fresh listing on every call, bypassing any on-disk List Cache snapshot.
    pub ignore_list_cache: bool,
    /// HMAC secret authenticating Block Cache entries.
    #[serde(with = "hex_bytes")]
    pub hmac_secret: Vec<u8>,
    /// Enable the Block Cache at all.
    pub use_block_cache: bool,
    /// Enable the List Cache at all.
    pub use_list_cache: bool,
}

impl Default for CachingOptions {
    fn default() -> Self {
        Self {
            cache_directory: String::new(),
            index_cache_directory: String::new(),
            max_cache_size_bytes: 1 << 30,
            max_list_cache_duration_sec: 60,
            ignore_list_cache: false,
            hmac_secret: Vec::new(),
            use_block_cache: true,
            use_list_cache: true,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_build_fluently_on_top_of_defaults() {
        let options = FormattingOptions::default()
            .max_pack_size(4096u64)
            .hash("HMAC-SHA256");
        assert_eq!(options.max_pack_size, 4096);
        assert_eq!(options.hash, "HMAC-SHA256");
    }

    #[test]
    fn caching_options_round_trip_through_json() {
        let options = CachingOptions::default().hmac_secret(vec![1, 2, 3]);
        let json = serde_json::to_string(&options).unwrap();
        let parsed: CachingOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hmac_secret, vec![1, 2, 3]);
    }
}
