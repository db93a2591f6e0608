//! Error types and Result module.

use std::num::TryFromIntError;

use displaydoc::Display;
use thiserror::Error;

/// Result type that is being returned from methods that can fail and thus have [`CoreError`]s.
pub type CoreResult<T> = Result<T, CoreError>;

// [`CoreError`] is public, but opaque and easy to keep compatible.
#[derive(Error, Debug)]
#[error(transparent)]
/// Errors that can result from the block storage core.
pub struct CoreError(#[from] Box<CoreErrorKind>);

impl CoreError {
    /// Expose the inner error kind.
    ///
    /// This is useful for matching on the error kind.
    #[must_use]
    pub fn into_inner(self) -> CoreErrorKind {
        *self.0
    }

    /// Borrow the inner error kind without consuming the error.
    #[must_use]
    pub fn kind(&self) -> &CoreErrorKind {
        &self.0
    }
}

/// [`CoreErrorKind`] describes the errors that can happen while operating the block store.
///
/// This is a non-exhaustive enum, so additional variants may be added in future. It is
/// recommended to match against the wildcard `_` instead of listing all possible variants,
/// to avoid problems when new variants are added.
#[non_exhaustive]
#[derive(Error, Debug, Display)]
pub enum CoreErrorKind {
    /// block {0} not found
    BlockNotFound(String),
    /// blob {0} not found in blob store
    BlobNotFound(String),
    /// invalid checksum for block {0}: decrypted payload does not match content id
    InvalidChecksum(String),
    /// invalid format: {0}
    InvalidFormat(String),
    /// invalid prefix {0:?}: must be a single letter in 'g'..='z'
    InvalidPrefix(char),
    /// operation canceled
    Canceled,
    /// transient blob store error: {0}
    TransientBlobError(String),
    /// master key missing or too short for the requested encryption scheme
    MasterKeyMissing,
    /// unknown algorithm: {0}
    UnknownAlgorithm(String),
    /// {0}
    #[error(transparent)]
    Crypto(#[from] CryptoErrorKind),
    /// {0}
    #[error(transparent)]
    Index(#[from] IndexErrorKind),
    /// {0}
    #[error(transparent)]
    Pack(#[from] PackErrorKind),
    /// {0}
    #[error(transparent)]
    Cache(#[from] CacheErrorKind),
    /// {0}
    #[error(transparent)]
    Manager(#[from] ManagerErrorKind),
    /// {0}
    #[error(transparent)]
    Backend(#[from] BackendErrorKind),
}

/// [`CryptoErrorKind`] describes errors from the Formatter (hashing + encryption registries).
#[derive(Error, Debug, Display)]
pub enum CryptoErrorKind {
    /// hash algorithm {0:?} is not registered
    UnknownHashAlgorithm(String),
    /// encryption algorithm {0:?} is not registered
    UnknownEncryptionAlgorithm(String),
    /// master key too short: need at least {needed} bytes, got {got}
    MasterKeyTooShort { needed: usize, got: usize },
    /// hash output of {hash_len} bytes is too short for encryption scheme requiring {iv_len}-byte IVs
    HashTooShortForEncryption { hash_len: usize, iv_len: usize },
    /// hash algorithm {hash:?} is incompatible with encryption algorithm {encryption:?}
    IncompatibleHashAndEncryption { hash: String, encryption: String },
    /// hmac secret must not be empty for keyed hash {0:?}
    EmptyHmacSecret(String),
    /// content hash tail does not match expected IV bytes
    AuthenticationFailed,
}

/// [`IndexErrorKind`] describes errors from pack-index encode/decode and the merged index.
#[derive(Error, Debug, Display)]
pub enum IndexErrorKind {
    /// pack index header is truncated or malformed
    TruncatedHeader,
    /// unsupported pack index format version {0}
    UnsupportedVersion(u16),
    /// pack index entry_count {declared} does not match available record bytes (stride {stride})
    EntryCountMismatch { declared: u32, stride: usize },
    /// field out of representable range while encoding pack index: {0}
    FieldOutOfRange(String),
    /// content id {0} exceeds the index's key_size
    ContentIdTooWide(String),
    /// pack reference offset/length out of bounds of the tail section
    TailReferenceOutOfBounds,
    /// {0:?}
    #[error(transparent)]
    FromTryIntError(#[from] TryFromIntError),
}

/// [`PackErrorKind`] describes errors from pack blob assembly, the postamble, and recovery.
#[derive(Error, Debug, Display)]
pub enum PackErrorKind {
    /// postamble length byte {0} is out of the valid range [5, 255]
    InvalidPostambleLength(u8),
    /// postamble CRC-32 mismatch: expected {expected:08x}, computed {computed:08x}
    PostambleCrcMismatch { expected: u32, computed: u32 },
    /// postamble declares an unknown flag value {0}
    UnknownPostambleFlag(u8),
    /// postamble would exceed 255 bytes once encoded
    PostambleTooLarge,
    /// local index offset/length in postamble is out of bounds of the pack blob
    LocalIndexOutOfBounds,
    /// pack blob is too short to contain a postamble
    PackTooShortForPostamble,
}

/// [`CacheErrorKind`] describes errors from the Block Cache and the Committed-Index Cache.
#[derive(Error, Debug, Display)]
pub enum CacheErrorKind {
    /// cache entry is malformed (truncated HMAC tag)
    MalformedEntry,
    /// cache entry failed HMAC authentication
    AuthenticationFailed,
    /// cache directory {0:?} could not be created
    CacheDirCreationFailed(String),
    /// {0:?}
    #[error(transparent)]
    FromIoError(#[from] std::io::Error),
}

/// [`ManagerErrorKind`] describes errors from Block Manager construction and compaction.
#[derive(Error, Debug, Display)]
pub enum ManagerErrorKind {
    /// repository format version {found} is below the minimum supported version {min}
    FormatVersionTooOld { found: u8, min: u8 },
    /// repository format version {found} is above the current write version {current}
    FormatVersionTooNew { found: u8, current: u8 },
    /// repository format bytes exceed the configured maximum pack size
    RepositoryFormatTooLarge,
}

/// [`BackendErrorKind`] describes errors surfaced by a concrete `BlobStore` implementation.
#[derive(Error, Debug, Display)]
pub enum BackendErrorKind {
    /// blob {0} not found
    NotFound(String),
    /// operation canceled
    Canceled,
    /// transient I/O error: {0}
    Transient(String),
    /// list consistency could not be established after {0} attempts
    InconsistentListing(usize),
    /// {0:?}
    #[error(transparent)]
    FromIoError(#[from] std::io::Error),
}

trait CoreErrorMarker: std::error::Error {}

impl CoreErrorMarker for CryptoErrorKind {}
impl CoreErrorMarker for IndexErrorKind {}
impl CoreErrorMarker for PackErrorKind {}
impl CoreErrorMarker for CacheErrorKind {}
impl CoreErrorMarker for ManagerErrorKind {}
impl CoreErrorMarker for BackendErrorKind {}

impl<E> From<E> for CoreError
where
    E: CoreErrorMarker,
    CoreErrorKind: From<E>,
{
    fn from(value: E) -> Self {
        Self(Box::new(CoreErrorKind::from(value)))
    }
}

impl From<CoreErrorKind> for CoreError {
    fn from(value: CoreErrorKind) -> Self {
        Self(Box::new(value))
    }
}
