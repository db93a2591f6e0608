//! A functional in-memory [`BlobStore`], used by this crate's own tests and exposed to
//! downstream callers under the `testing` feature for their own integration tests.
//!
//! Replaces the teacher's `backend::mock::MockBackend`, whose methods are `todo!()`-stubbed
//! and only exist to satisfy trait bounds in doctests; every method here is a real,
//! independently-usable implementation, grounded on the same "`HashMap` behind a `Mutex`"
//! shape as [`crate::index::committed::MemoryIndexCache`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::backend::{BlobMetadata, BlobStore};
use crate::cancel::CancellationToken;
use crate::error::{BackendErrorKind, CoreResult};

#[derive(Default)]
struct Entry {
    bytes: Vec<u8>,
    timestamp_seconds: u64,
}

/// An in-memory Blob Store backed by a `HashMap`. `touch_blob` is implemented (unlike a real
/// capability-absent store) so cache-sweeper tests can exercise the LRU path directly.
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock_seconds: Mutex<u64>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the store's internal clock, used by tests to control `timestamp_seconds`
    /// deterministically without depending on wall-clock time.
    pub fn advance_clock(&self, by_seconds: u64) {
        *self.clock_seconds.lock().unwrap() += by_seconds;
    }

    fn now(&self) -> u64 {
        *self.clock_seconds.lock().unwrap()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get_blob(
        &self,
        id: &str,
        offset: u64,
        length: Option<u64>,
        cancel: &CancellationToken,
    ) -> CoreResult<Vec<u8>> {
        cancel.check()?;
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(id)
            .ok_or_else(|| BackendErrorKind::NotFound(id.to_owned()))?;
        let start = offset as usize;
        let end = match length {
            Some(len) => (start + len as usize).min(entry.bytes.len()),
            None => entry.bytes.len(),
        };
        Ok(entry.bytes.get(start..end).unwrap_or_default().to_vec())
    }

    fn put_blob(&self, id: &str, bytes: &[u8], cancel: &CancellationToken) -> CoreResult<()> {
        cancel.check()?;
        let now = self.now();
        self.entries.lock().unwrap().insert(
            id.to_owned(),
            Entry {
                bytes: bytes.to_vec(),
                timestamp_seconds: now,
            },
        );
        Ok(())
    }

    fn delete_blob(&self, id: &str, cancel: &CancellationToken) -> CoreResult<()> {
        cancel.check()?;
        self.entries
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BackendErrorKind::NotFound(id.to_owned()).into())
    }

    fn list_blobs(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
        cb: &mut dyn FnMut(BlobMetadata) -> CoreResult<()>,
    ) -> CoreResult<()> {
        cancel.check()?;
        let snapshot: Vec<(String, usize, u64)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(id, entry)| (id.clone(), entry.bytes.len(), entry.timestamp_seconds))
            .collect();
        for (id, length, timestamp_seconds) in snapshot {
            cancel.check()?;
            cb(BlobMetadata {
                id,
                length: length as u64,
                timestamp_seconds,
            })?;
        }
        Ok(())
    }

    fn touch_blob(&self, id: &str, cancel: &CancellationToken) -> CoreResult<bool> {
        cancel.check()?;
        let now = self.now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.timestamp_seconds = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
