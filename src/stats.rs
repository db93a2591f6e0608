//! Block Manager statistics (§4.2): atomically-updated counters, snapshotted on demand.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters updated in place by the Block Manager as it hashes, encrypts, reads, and
/// writes blocks. Never reset implicitly; callers diff two [`StatsSnapshot`]s if they need a
/// delta over a window.
#[derive(Debug, Default)]
pub struct Stats {
    hashed_blocks: AtomicU64,
    hashed_bytes: AtomicU64,
    encrypted_bytes: AtomicU64,
    decrypted_bytes: AtomicU64,
    written_blocks: AtomicU64,
    written_bytes: AtomicU64,
    read_blocks: AtomicU64,
    read_bytes: AtomicU64,
    valid_blocks: AtomicU64,
    invalid_blocks: AtomicU64,
}

/// A point-in-time copy of [`Stats`], cheap to pass around and compare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hashed_blocks: u64,
    pub hashed_bytes: u64,
    pub encrypted_bytes: u64,
    pub decrypted_bytes: u64,
    pub written_blocks: u64,
    pub written_bytes: u64,
    pub read_blocks: u64,
    pub read_bytes: u64,
    pub valid_blocks: u64,
    pub invalid_blocks: u64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hash(&self, bytes: u64) {
        self.hashed_blocks.fetch_add(1, Ordering::Relaxed);
        self.hashed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_encrypt(&self, bytes: u64) {
        self.encrypted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_decrypt(&self, bytes: u64) {
        self.decrypted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.written_blocks.fetch_add(1, Ordering::Relaxed);
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: u64) {
        self.read_blocks.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_valid(&self) {
        self.valid_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid_blocks.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hashed_blocks: self.hashed_blocks.load(Ordering::Relaxed),
            hashed_bytes: self.hashed_bytes.load(Ordering::Relaxed),
            encrypted_bytes: self.encrypted_bytes.load(Ordering::Relaxed),
            decrypted_bytes: self.decrypted_bytes.load(Ordering::Relaxed),
            written_blocks: self.written_blocks.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
            read_blocks: self.read_blocks.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            valid_blocks: self.valid_blocks.load(Ordering::Relaxed),
            invalid_blocks: self.invalid_blocks.load(Ordering::Relaxed),
        }
    }
}
