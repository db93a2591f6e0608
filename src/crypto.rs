//! Content hashing and block encryption: the Formatter and its two independent registries.

use crate::error::{CoreErrorKind, CoreResult, CryptoErrorKind};

pub(crate) mod cipher;
pub(crate) mod hash_algo;

/// Minimum number of bytes a master key must supply for an encrypted scheme.
pub const MIN_MASTER_KEY_LEN: usize = 32;

/// A registered content-hashing algorithm.
///
/// Implementors must be deterministic: identical `data` must always produce identical
/// output, independent of process, machine, or call order.
pub trait HashAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;
    /// Length in bytes of [`HashAlgorithm::compute`]'s output.
    fn output_len(&self) -> usize;
    fn compute(&self, data: &[u8]) -> Vec<u8>;
}

/// A registered block encryption algorithm.
pub trait EncryptionAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;
    /// Minimum IV length, in bytes, this scheme needs from the hash output supplied to it.
    fn min_iv_len(&self) -> usize;
    /// Whether ciphertext produced by this scheme is self-authenticating (carries its own
    /// tag), in which case the content-addressed hash-tail check in §4.2 is skipped.
    fn is_authenticated(&self) -> bool;
    fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>>;
}

/// Computes content ids and encrypts/decrypts block payloads using one registered hash
/// algorithm and one registered encryption algorithm, bound together at construction time.
pub struct Formatter {
    hash: Box<dyn HashAlgorithm>,
    encryption: Box<dyn EncryptionAlgorithm>,
}

impl Formatter {
    /// Build a `Formatter` from algorithm names and key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoErrorKind::UnknownHashAlgorithm`] / [`CryptoErrorKind::UnknownEncryptionAlgorithm`]
    /// for unregistered names, [`CryptoErrorKind::MasterKeyTooShort`] if `master_key` is too
    /// short for an encrypted scheme, and [`CryptoErrorKind::HashTooShortForEncryption`] if
    /// the chosen hash's output is narrower than the chosen encryption's minimum IV length.
    pub fn new(
        hash_name: &str,
        encryption_name: &str,
        hmac_secret: &[u8],
        master_key: &[u8],
    ) -> CoreResult<Self> {
        let hash = hash_algo::build(hash_name, hmac_secret)?;
        let encryption = cipher::build(encryption_name, master_key)?;

        if hash.output_len() < encryption.min_iv_len() {
            return Err(CryptoErrorKind::HashTooShortForEncryption {
                hash_len: hash.output_len(),
                iv_len: encryption.min_iv_len(),
            }
            .into());
        }

        Ok(Self { hash, encryption })
    }

    #[must_use]
    pub fn hash_name(&self) -> &'static str {
        self.hash.name()
    }

    #[must_use]
    pub fn encryption_name(&self) -> &'static str {
        self.encryption.name()
    }

    /// `compute_id(data) -> bytes`, deterministic and collision-resistant (§4.1).
    #[must_use]
    pub fn compute_id(&self, data: &[u8]) -> Vec<u8> {
        self.hash.compute(data)
    }

    /// Encrypt (or, for the `NONE` scheme, pass through) `plaintext` under `iv`.
    ///
    /// # Errors
    ///
    /// Propagates the underlying [`EncryptionAlgorithm::encrypt`] error.
    pub fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>> {
        self.encryption.encrypt(plaintext, iv)
    }

    /// Decrypt (CTR-mode schemes use the same routine for both directions).
    ///
    /// # Errors
    ///
    /// Propagates the underlying [`EncryptionAlgorithm::decrypt`] error.
    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> CoreResult<Vec<u8>> {
        self.encryption.decrypt(ciphertext, iv)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.encryption.is_authenticated()
    }

    /// Verify a decrypted payload against the trailing bytes of a content id's hash, per
    /// §4.2's "content-addressed checksum": re-hash `plaintext` and compare its tail to the
    /// tail of `expected_hash`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoErrorKind::AuthenticationFailed`] on mismatch.
    pub fn verify_content_hash(&self, plaintext: &[u8], expected_hash: &[u8]) -> CoreResult<()> {
        let recomputed = self.hash.compute(plaintext);
        let tail_len = expected_hash.len().min(recomputed.len()).min(16);
        let recomputed_tail = &recomputed[recomputed.len() - tail_len..];
        let expected_tail = &expected_hash[expected_hash.len() - tail_len..];
        if recomputed_tail == expected_tail {
            Ok(())
        } else {
            Err(CryptoErrorKind::AuthenticationFailed.into())
        }
    }
}

pub(crate) fn unknown_hash(name: &str) -> CoreErrorKind {
    CryptoErrorKind::UnknownHashAlgorithm(name.to_owned()).into()
}

pub(crate) fn unknown_encryption(name: &str) -> CoreErrorKind {
    CryptoErrorKind::UnknownEncryptionAlgorithm(name.to_owned()).into()
}
