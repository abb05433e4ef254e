//! Node directory: handle allocation, live-node ownership, suspension.
//!
//! Every cross-node reference in the engine is a [`NodeId`]; no structure
//! ever holds a direct reference to another node's data. The directory maps
//! ids to [`NodeCell`]s, each a reader/writer lock around an `Option` of the
//! node: `Some` while live, `None` while suspended. The cell lock serves
//! double duty as the node's structural lock for lattice traversal and
//! mutation.
//!
//! # Invariants
//! - A handle compares by id alone, independent of liveness.
//! - `read`/`write` transparently reactivate a suspended node; for a given
//!   handle the reactivation codec runs at most once per suspension, because
//!   reactivation happens under the cell's write lock.
//! - Suspension performs at most one `store` call (zero when the node is not
//!   modified) and reactivation exactly one `retrieve` call.
//! - The directory owns live nodes via a strong map; suspension and
//!   `discard` are the only paths that shrink a node's in-memory footprint.
//!   The policy choosing *which* handle to suspend is the caller's.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::suspend::{compress, decompress, SuspensionStore};

/// Opaque, totally ordered handle for a lattice node.
///
/// Equality and ordering are by id alone; a handle stays valid while its
/// node is suspended.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a handle from a raw id.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Contract every directory-managed node fulfils.
///
/// A node with `is_modified() == false` never needs to be persisted:
/// suspending it just discards the in-memory object, and reactivation
/// re-derives it from the last persisted bytes (which must decode with the
/// modified flag cleared).
pub trait Suspendable: Sized + Send + Sync {
    /// Dirty flag: set on any persistent mutation.
    fn is_modified(&self) -> bool;

    /// Clears the dirty flag after a successful persist.
    fn clear_modified(&mut self);

    /// Hook invoked before persistence; drops transient state.
    fn on_suspend(&mut self) {}

    /// Hook invoked after restoration; rebuilds transient state.
    fn on_reactivate(&mut self) {}

    /// Encodes the node into its self-describing snapshot bytes.
    fn encode(&self) -> std::result::Result<Vec<u8>, serde_cbor::Error>;

    /// Exactly inverts [`Suspendable::encode`].
    fn decode(bytes: &[u8]) -> std::result::Result<Self, serde_cbor::Error>;
}

/// One directory slot: the node while live, `None` while suspended.
pub type NodeCell<T> = RwLock<Option<T>>;

/// Shared read access to a live node.
///
/// Holds the cell's read lock; the node cannot be suspended while this guard
/// exists.
pub struct NodeRef<T> {
    guard: ArcRwLockReadGuard<RawRwLock, Option<T>>,
}

impl<T> std::ops::Deref for NodeRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // The slot is Some for as long as the read lock is held; suspension
        // requires the write lock.
        self.guard.as_ref().expect("node slot emptied under read lock")
    }
}

/// Exclusive access to a live node.
pub struct NodeRefMut<T> {
    guard: ArcRwLockWriteGuard<RawRwLock, Option<T>>,
}

impl<T> std::ops::Deref for NodeRefMut<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("node slot emptied under write lock")
    }
}

impl<T> std::ops::DerefMut for NodeRefMut<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("node slot emptied under write lock")
    }
}

/// Process-wide id → node mapping with suspension mechanics.
pub struct NodeDirectory<T> {
    cells: RwLock<HashMap<NodeId, Arc<NodeCell<T>>>>,
    live: Mutex<BTreeSet<NodeId>>,
    next_id: AtomicU64,
    store: Option<Arc<dyn SuspensionStore>>,
    gzip_level: u32,
}

impl<T: Suspendable> NodeDirectory<T> {
    /// Creates a directory without a suspension store. Nodes can only be
    /// discarded, never suspended.
    pub fn in_memory() -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            live: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(0),
            store: None,
            gzip_level: 6,
        }
    }

    /// Creates a directory backed by `store`.
    pub fn with_store(store: Arc<dyn SuspensionStore>, gzip_level: u32) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            live: Mutex::new(BTreeSet::new()),
            next_id: AtomicU64::new(0),
            store: Some(store),
            gzip_level,
        }
    }

    /// Mints a fresh handle, delegating to the store's allocator when one is
    /// attached so that ids stay stable across engine restarts.
    pub fn allocate(&self) -> NodeId {
        match &self.store {
            Some(store) => NodeId::new(store.allocate_id()),
            None => NodeId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Registers a freshly created live node under `id`.
    ///
    /// # Panics
    /// Panics if `id` is already registered; handles are never reused.
    pub fn register(&self, id: NodeId, node: T) {
        let cell = Arc::new(RwLock::new(Some(node)));
        let prev = self.cells.write().insert(id, cell);
        assert!(prev.is_none(), "handle {id} registered twice");
        self.live.lock().insert(id);
    }

    /// Removes `id` from the directory entirely (logical teardown, e.g. after
    /// lattice removal). The persisted state, if any, is left to the store.
    pub fn unregister(&self, id: NodeId) {
        self.cells.write().remove(&id);
        self.live.lock().remove(&id);
    }

    /// Returns whether `id` is registered (live or suspended).
    pub fn contains(&self, id: NodeId) -> bool {
        self.cells.read().contains_key(&id)
    }

    /// Returns whether `id` is currently suspended.
    pub fn is_suspended(&self, id: NodeId) -> bool {
        match self.cells.read().get(&id) {
            Some(cell) => cell.read().is_none(),
            None => false,
        }
    }

    /// Handles of all currently live nodes, ascending.
    pub fn live_handles(&self) -> Vec<NodeId> {
        self.live.lock().iter().copied().collect()
    }

    fn cell(&self, id: NodeId) -> Result<Arc<NodeCell<T>>> {
        self.cells
            .read()
            .get(&id)
            .cloned()
            .ok_or(LatticeError::UnknownHandle(id))
    }

    /// Shared access to the node behind `id`, reactivating it if suspended.
    pub fn read(&self, id: NodeId) -> Result<NodeRef<T>> {
        let cell = self.cell(id)?;
        let guard = RwLock::read_arc(&cell);
        if guard.is_some() {
            return Ok(NodeRef { guard });
        }
        drop(guard);

        let mut w = RwLock::write_arc(&cell);
        if w.is_none() {
            *w = Some(self.reactivate(id)?);
            self.live.lock().insert(id);
        }
        let guard = ArcRwLockWriteGuard::downgrade(w);
        Ok(NodeRef { guard })
    }

    /// Exclusive access to the node behind `id`, reactivating it if
    /// suspended. Multi-node acquisition must follow ascending handle order.
    pub fn write(&self, id: NodeId) -> Result<NodeRefMut<T>> {
        let cell = self.cell(id)?;
        let mut guard = RwLock::write_arc(&cell);
        if guard.is_none() {
            *guard = Some(self.reactivate(id)?);
            self.live.lock().insert(id);
        }
        Ok(NodeRefMut { guard })
    }

    /// Persists `id` (iff modified) and discards its in-memory object.
    ///
    /// A failure leaves the node live; callers must not assume the node is
    /// safely persisted until this returns `Ok`.
    pub fn suspend(&self, id: NodeId) -> Result<()> {
        let cell = self.cell(id)?;
        let mut guard = cell.write();
        let Some(node) = guard.as_mut() else {
            return Ok(()); // already suspended
        };
        let store = self.store.as_ref().ok_or(LatticeError::NoStore(id))?;

        node.on_suspend();
        if node.is_modified() {
            let bytes = node
                .encode()
                .map_err(|source| LatticeError::Codec { id, source })?;
            let packed = compress(&bytes, self.gzip_level)
                .map_err(|source| LatticeError::Store { id, source })?;
            store
                .store(id.raw(), &packed)
                .map_err(|source| LatticeError::Store { id, source })?;
            // Cleared only once the bytes are safely stored; a failed store
            // must leave the node dirty so a retry persists it.
            node.clear_modified();
            tracing::debug!(node = %id, bytes = packed.len(), "suspended");
        }
        *guard = None;
        self.live.lock().remove(&id);
        Ok(())
    }

    /// Drops the live object without persisting (pure in-memory teardown).
    pub fn discard(&self, id: NodeId) -> Result<()> {
        let cell = self.cell(id)?;
        *cell.write() = None;
        self.live.lock().remove(&id);
        Ok(())
    }

    fn reactivate(&self, id: NodeId) -> Result<T> {
        let store = self.store.as_ref().ok_or(LatticeError::NoStore(id))?;
        let packed = store
            .retrieve(id.raw())
            .map_err(|source| LatticeError::Store { id, source })?
            .ok_or(LatticeError::MissingState(id))?;
        let bytes =
            decompress(&packed).map_err(|source| LatticeError::Store { id, source })?;
        let mut node =
            T::decode(&bytes).map_err(|source| LatticeError::Codec { id, source })?;
        node.on_reactivate();
        tracing::debug!(node = %id, "reactivated");
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::suspend::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        value: u32,
        #[serde(skip)]
        modified: bool,
    }

    impl Suspendable for Probe {
        fn is_modified(&self) -> bool {
            self.modified
        }

        fn clear_modified(&mut self) {
            self.modified = false;
        }

        fn encode(&self) -> std::result::Result<Vec<u8>, serde_cbor::Error> {
            serde_cbor::to_vec(self)
        }

        fn decode(bytes: &[u8]) -> std::result::Result<Self, serde_cbor::Error> {
            serde_cbor::from_slice(bytes)
        }
    }

    /// Rejects the first `failures` store calls, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl SuspensionStore for FlakyStore {
        fn allocate_id(&self) -> u64 {
            self.inner.allocate_id()
        }

        fn store(&self, id: u64, bytes: &[u8]) -> io::Result<()> {
            let fail = self
                .failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(io::Error::new(io::ErrorKind::Other, "store offline"));
            }
            self.inner.store(id, bytes)
        }

        fn retrieve(&self, id: u64) -> io::Result<Option<Vec<u8>>> {
            self.inner.retrieve(id)
        }
    }

    #[test]
    fn handle_ordering_is_by_id() {
        let a = NodeId::new(1);
        let b = NodeId::new(2);
        assert!(a < b);
        assert_eq!(a, NodeId::new(1));
        assert_eq!(a.to_string(), "n1");
    }

    #[test]
    fn suspend_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let dir: NodeDirectory<Probe> = NodeDirectory::with_store(store.clone(), 6);

        let id = dir.allocate();
        dir.register(id, Probe { value: 42, modified: true });

        dir.suspend(id).unwrap();
        assert!(dir.is_suspended(id));
        assert_eq!(store.store_calls(), 1);

        // Reactivation decodes the persisted bytes and clears the flag.
        let node = dir.read(id).unwrap();
        assert_eq!(node.value, 42);
        assert!(!node.is_modified());
        assert_eq!(store.retrieve_calls(), 1);
    }

    #[test]
    fn failed_store_keeps_the_node_dirty() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(1),
        });
        let dir: NodeDirectory<Probe> = NodeDirectory::with_store(store.clone(), 6);

        let id = dir.allocate();
        dir.register(id, Probe { value: 11, modified: true });

        assert!(matches!(dir.suspend(id), Err(LatticeError::Store { .. })));
        // The node must stay live and dirty so a retry persists it.
        assert!(!dir.is_suspended(id));
        assert!(dir.read(id).unwrap().is_modified());

        dir.suspend(id).unwrap();
        assert_eq!(store.inner.store_calls(), 1);
        assert_eq!(dir.read(id).unwrap().value, 11);
    }

    #[test]
    fn clean_suspend_skips_store_but_still_retrieves() {
        let store = Arc::new(MemoryStore::new());
        let dir: NodeDirectory<Probe> = NodeDirectory::with_store(store.clone(), 6);

        let id = dir.allocate();
        dir.register(id, Probe { value: 7, modified: true });
        dir.suspend(id).unwrap();
        let baseline = store.store_calls();

        // Touch without modifying, suspend again: no new store call.
        {
            let node = dir.read(id).unwrap();
            assert_eq!(node.value, 7);
        }
        dir.suspend(id).unwrap();
        assert_eq!(store.store_calls(), baseline);

        // But the next access still performs exactly one retrieve.
        let before = store.retrieve_calls();
        let _ = dir.read(id).unwrap();
        assert_eq!(store.retrieve_calls(), before + 1);
    }

    #[test]
    fn reencode_matches_persisted_bytes() {
        let store = Arc::new(MemoryStore::new());
        let dir: NodeDirectory<Probe> = NodeDirectory::with_store(store.clone(), 6);

        let id = dir.allocate();
        dir.register(id, Probe { value: 9000, modified: true });
        dir.suspend(id).unwrap();

        let persisted = store.retrieve(id.raw()).unwrap().unwrap();
        let reencoded = {
            let node = dir.read(id).unwrap();
            compress(&node.encode().unwrap(), 6).unwrap()
        };
        assert_eq!(persisted, reencoded);
    }

    #[test]
    fn discard_drops_without_store() {
        let dir: NodeDirectory<Probe> = NodeDirectory::in_memory();
        let id = dir.allocate();
        dir.register(id, Probe { value: 1, modified: true });
        dir.discard(id).unwrap();
        assert!(dir.is_suspended(id));
        // No store attached: reading back fails loudly.
        assert!(matches!(dir.read(id), Err(LatticeError::NoStore(_))));
    }

    #[test]
    fn unknown_handle() {
        let dir: NodeDirectory<Probe> = NodeDirectory::in_memory();
        assert!(matches!(
            dir.read(NodeId::new(99)),
            Err(LatticeError::UnknownHandle(_))
        ));
    }

    #[test]
    fn write_access_mutates_in_place() {
        let dir: NodeDirectory<Probe> = NodeDirectory::in_memory();
        let id = dir.allocate();
        dir.register(id, Probe { value: 0, modified: false });
        {
            let mut node = dir.write(id).unwrap();
            node.value = 5;
            node.modified = true;
        }
        assert_eq!(dir.read(id).unwrap().value, 5);
        assert_eq!(dir.live_handles(), vec![id]);
    }
}
