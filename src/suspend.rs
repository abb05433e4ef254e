//! Suspension boundary: external storage for idle nodes.
//!
//! A node that has not been touched for a while can be written out to an
//! external store and dropped from memory; the directory re-materializes it
//! on the next access. This module owns the storage trait and the byte
//! envelope: a gzip stream over a self-describing CBOR snapshot. Compression
//! and codec must exactly invert each other; the round trip is covered by
//! tests in `pattern`.
//!
//! The *policy* deciding when to suspend lives outside this crate; only the
//! mechanics are here.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

/// External storage for suspended node snapshots.
///
/// Implementations must be usable from multiple sessions concurrently.
/// `store`/`retrieve` are invoked exactly once per suspend/reactivate; the
/// engine never retries on failure.
pub trait SuspensionStore: Send + Sync {
    /// Mints a fresh node id.
    fn allocate_id(&self) -> u64;

    /// Persists the envelope bytes for `id`, replacing any previous value.
    fn store(&self, id: u64, bytes: &[u8]) -> io::Result<()>;

    /// Retrieves the envelope bytes last stored for `id`.
    fn retrieve(&self, id: u64) -> io::Result<Option<Vec<u8>>>;
}

/// Gzip-compresses an encoded snapshot.
pub fn compress(bytes: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::new(level));
    enc.write_all(bytes)?;
    enc.finish()
}

/// Inverts [`compress`].
pub fn decompress(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut dec = GzDecoder::new(bytes);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)?;
    Ok(out)
}

/// In-memory store for tests and small models.
///
/// Counts store/retrieve traffic so callers can assert on suspension
/// behavior (a clean node must produce zero store calls).
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
    stores: AtomicUsize,
    retrieves: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `store` calls performed so far.
    pub fn store_calls(&self) -> usize {
        self.stores.load(Ordering::Relaxed)
    }

    /// Number of `retrieve` calls performed so far.
    pub fn retrieve_calls(&self) -> usize {
        self.retrieves.load(Ordering::Relaxed)
    }
}

impl SuspensionStore for MemoryStore {
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn store(&self, id: u64, bytes: &[u8]) -> io::Result<()> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.data.lock().insert(id, bytes.to_vec());
        Ok(())
    }

    fn retrieve(&self, id: u64) -> io::Result<Option<Vec<u8>>> {
        self.retrieves.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.lock().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_round_trip() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(16);
        let packed = compress(&payload, 6).unwrap();
        assert!(packed.len() < payload.len());
        assert_eq!(decompress(&packed).unwrap(), payload);
    }

    #[test]
    fn memory_store_traffic() {
        let store = MemoryStore::new();
        let a = store.allocate_id();
        let b = store.allocate_id();
        assert_ne!(a, b);

        store.store(a, b"one").unwrap();
        assert_eq!(store.retrieve(a).unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(store.retrieve(b).unwrap(), None);
        assert_eq!(store.store_calls(), 1);
        assert_eq!(store.retrieve_calls(), 2);
    }
}
