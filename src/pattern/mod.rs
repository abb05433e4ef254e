//! Pattern lattice: conjunctions of primitive input refinements.
//!
//! Input nodes (level 1) and AND-nodes together contain every tracked
//! substructure of any conjunction. For the conjunction ABCD the lattice
//! holds ABCD, ABC, ABD, ACD, BCD, AB, AC, AD, BC, BD, CD, A, B, C, D,
//! organized in levels by conjunction size and connected through
//! refinements: ABD on level 3 reaches ABCD on level 4 via the refinement C.
//!
//! Nodes are shared by all sessions and referenced exclusively through
//! [`NodeId`] handles resolved by the [`NodeDirectory`], so any node can be
//! suspended to external storage and transparently reactivated mid-
//! traversal.
//!
//! # Invariants
//! - Subset lattice: every refinement-removal of an AND-node's refinement
//!   set, offsets renormalized, is the refinement set of a reachable parent.
//! - No duplicates: a normalized refinement set maps to exactly one handle,
//!   ever.

mod and_node;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::activation::cmp_rid;
use crate::config::Config;
use crate::directory::{NodeDirectory, NodeId, NodeRef, NodeRefMut, Suspendable};
use crate::error::Result;
use crate::suspend::SuspensionStore;

/// One "add a feature" edge: an optional relative position offset plus the
/// input node contributing the feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refinement {
    /// Relational-id offset; `None` for position-free features.
    pub rid: Option<i32>,
    /// Handle of the contributing input node.
    pub input: NodeId,
}

impl Refinement {
    /// Plain constructor, no offset normalization.
    pub fn new(rid: Option<i32>, input: NodeId) -> Self {
        Self { rid, input }
    }

    /// Constructor normalizing `rid` against a base `offset`:
    /// a rid with no base offset collapses to 0; if either side is absent
    /// the result is position-free; otherwise the rid is rebased.
    pub fn relative(rid: Option<i32>, offset: Option<i32>, input: NodeId) -> Self {
        let rid = match (rid, offset) {
            (Some(_), None) => Some(0),
            (None, _) => None,
            (Some(r), Some(o)) => Some(r - o),
        };
        Self { rid, input }
    }

    /// Negative part of the rid (the base offset of this edge).
    pub fn offset(&self) -> Option<i32> {
        self.rid.map(|r| r.min(0))
    }

    /// Non-negative part of the rid.
    pub fn relative_position(&self) -> Option<i32> {
        self.rid.map(|r| r.max(0))
    }
}

impl Ord for Refinement {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.input
            .cmp(&other.input)
            .then_with(|| cmp_rid(self.rid, other.rid))
    }
}

impl PartialOrd for Refinement {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Reverse child-table key: which refinement leads from this node to a given
/// child, disambiguated by the rid direction between the child's and the
/// parent activation's rid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReverseRef {
    /// Child node handle.
    pub node: NodeId,
    /// Direction bit; see [`rid_direction`].
    pub dir: bool,
}

/// Direction bit for reverse child lookups: true unless both rids are
/// present and `a < b`.
pub fn rid_direction(a: Option<i32>, b: Option<i32>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a >= b,
        _ => true,
    }
}

/// `min` over optional rids; an absent side yields the other.
pub fn null_safe_min(a: Option<i32>, b: Option<i32>) -> Option<i32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// `a - b` when both present.
pub fn null_safe_sub(a: Option<i32>, b: Option<i32>) -> Option<i32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a - b),
        _ => None,
    }
}

/// `a + b` when both present.
pub fn null_safe_add(a: Option<i32>, b: Option<i32>) -> Option<i32> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        _ => None,
    }
}

/// AND-node specific state.
#[derive(Debug, Clone)]
pub struct AndState {
    /// Refinement r → parent node for the refinement set minus r.
    pub parents: BTreeMap<Refinement, NodeId>,
    /// Re-scoring threshold over the global position count.
    pub positions_notify: u32,
    /// Re-scoring threshold over this node's frequency.
    pub frequency_notify: u32,
    /// Last significance score; negative until first scored.
    pub weight: f64,
}

/// Node subtype discriminator plus subtype state.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Primitive input feature, level 1.
    Input,
    /// Conjunction of `level` refinements.
    And(AndState),
}

/// A pattern-lattice node. Shared across sessions; all per-session state
/// (activations, pending batches) lives in `Session`.
#[derive(Debug, Clone)]
pub struct LatticeNode {
    /// Own handle.
    pub id: NodeId,
    /// Conjunction size; input nodes are level 1.
    pub level: u32,
    /// Total observed firings.
    pub frequency: u32,
    /// Expected frequency under the independence null hypothesis.
    pub null_hyp_freq: f64,
    /// Previous null-hypothesis estimate, for the re-scoring gate.
    pub old_null_hyp_freq: f64,
    /// Blocked nodes are skipped by discovery and scoring.
    pub is_blocked: bool,
    /// Maintain the by-range-end activation view.
    pub end_required: bool,
    /// Maintain the by-rid activation view.
    pub rid_required: bool,
    /// Evidence arrived since the last scoring pass.
    pub frequency_has_changed: bool,
    /// Global position count at creation time.
    pub n_offset: u32,
    /// Accumulated activation range widths.
    pub size_sum: u32,
    /// Accumulated activation count.
    pub instance_sum: u32,
    /// Refinement → child AND-node.
    pub and_children: BTreeMap<Refinement, NodeId>,
    /// (child, rid-direction) → refinement; rebuilt on reactivation.
    pub reverse_children: BTreeMap<ReverseRef, Refinement>,
    /// Opaque external consumers keeping this node required.
    pub consumers: BTreeSet<u64>,
    /// Terminal removal flag.
    pub removed: bool,
    /// Dirty flag; suspension skips persistence when clear.
    pub modified: bool,
    /// Subtype state.
    pub kind: NodeKind,
}

impl LatticeNode {
    fn new(id: NodeId, level: u32, n_offset: u32, kind: NodeKind) -> Self {
        Self {
            id,
            level,
            frequency: 0,
            null_hyp_freq: 0.0,
            old_null_hyp_freq: 0.0,
            is_blocked: false,
            end_required: false,
            rid_required: false,
            frequency_has_changed: true,
            n_offset,
            size_sum: 0,
            instance_sum: 0,
            and_children: BTreeMap::new(),
            reverse_children: BTreeMap::new(),
            consumers: BTreeSet::new(),
            removed: false,
            modified: true,
            kind,
        }
    }

    /// AND-node state.
    ///
    /// # Panics
    /// Panics on input nodes.
    pub fn and(&self) -> &AndState {
        match &self.kind {
            NodeKind::And(state) => state,
            NodeKind::Input => panic!("input node {} has no AND state", self.id),
        }
    }

    pub(crate) fn and_mut(&mut self) -> &mut AndState {
        match &mut self.kind {
            NodeKind::And(state) => state,
            NodeKind::Input => panic!("input node {} has no AND state", self.id),
        }
    }

    /// True for input nodes.
    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input)
    }

    /// Links `child` under `refinement`.
    ///
    /// # Panics
    /// Panics on duplicate refinement insert.
    pub(crate) fn add_and_child(&mut self, refinement: Refinement, child: NodeId) {
        let prev = self.and_children.insert(refinement, child);
        assert!(prev.is_none(), "duplicate refinement insert on {}", self.id);
        self.reverse_children.insert(
            ReverseRef { node: child, dir: rid_direction(refinement.rid, Some(0)) },
            refinement,
        );
        self.modified = true;
    }

    /// Unlinks the child registered under `refinement`.
    pub(crate) fn remove_and_child(&mut self, refinement: &Refinement) {
        if let Some(child) = self.and_children.remove(refinement) {
            self.reverse_children.remove(&ReverseRef {
                node: child,
                dir: rid_direction(refinement.rid, Some(0)),
            });
            self.modified = true;
        }
    }

    /// Looks up the refinement from this node to `child` for the rid pair
    /// (child activation rid, this node's activation rid).
    pub fn reverse_refinement(
        &self,
        child: NodeId,
        child_rid: Option<i32>,
        own_rid: Option<i32>,
    ) -> Option<Refinement> {
        self.reverse_children
            .get(&ReverseRef { node: child, dir: rid_direction(child_rid, own_rid) })
            .copied()
    }

    /// The refinement set S combining into this node, from the parent table
    /// (AND-nodes) or the node itself (input nodes).
    pub fn refinement_set(&self) -> BTreeSet<Refinement> {
        match &self.kind {
            NodeKind::Input => {
                let mut set = BTreeSet::new();
                set.insert(Refinement::new(None, self.id));
                set
            }
            NodeKind::And(state) => state.parents.keys().copied().collect(),
        }
    }

    /// A required node survives cleanup regardless of frequency.
    pub fn is_required(&self) -> bool {
        !self.consumers.is_empty()
    }
}

// ---- snapshot codec --------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct BaseSnapshot {
    id: NodeId,
    level: u32,
    frequency: u32,
    null_hyp_freq: f64,
    old_null_hyp_freq: f64,
    is_blocked: bool,
    end_required: bool,
    rid_required: bool,
    frequency_has_changed: bool,
    n_offset: u32,
    size_sum: u32,
    instance_sum: u32,
    children: Vec<(Refinement, NodeId)>,
    consumers: Vec<u64>,
}

/// Self-describing envelope: the enum tag names the node subtype; the
/// refinement tables are count-prefixed lists of (refinement, id) pairs and
/// carry only raw ids, resolved lazily through the directory.
#[derive(Debug, Serialize, Deserialize)]
enum NodeSnapshot {
    Input(BaseSnapshot),
    And {
        base: BaseSnapshot,
        parents: Vec<(Refinement, NodeId)>,
        positions_notify: u32,
        frequency_notify: u32,
        weight: f64,
    },
}

impl LatticeNode {
    fn to_snapshot(&self) -> NodeSnapshot {
        let base = BaseSnapshot {
            id: self.id,
            level: self.level,
            frequency: self.frequency,
            null_hyp_freq: self.null_hyp_freq,
            old_null_hyp_freq: self.old_null_hyp_freq,
            is_blocked: self.is_blocked,
            end_required: self.end_required,
            rid_required: self.rid_required,
            frequency_has_changed: self.frequency_has_changed,
            n_offset: self.n_offset,
            size_sum: self.size_sum,
            instance_sum: self.instance_sum,
            children: self.and_children.iter().map(|(r, n)| (*r, *n)).collect(),
            consumers: self.consumers.iter().copied().collect(),
        };
        match &self.kind {
            NodeKind::Input => NodeSnapshot::Input(base),
            NodeKind::And(state) => NodeSnapshot::And {
                base,
                parents: state.parents.iter().map(|(r, n)| (*r, *n)).collect(),
                positions_notify: state.positions_notify,
                frequency_notify: state.frequency_notify,
                weight: state.weight,
            },
        }
    }

    fn from_snapshot(snapshot: NodeSnapshot) -> Self {
        let (base, kind) = match snapshot {
            NodeSnapshot::Input(base) => (base, NodeKind::Input),
            NodeSnapshot::And {
                base,
                parents,
                positions_notify,
                frequency_notify,
                weight,
            } => (
                base,
                NodeKind::And(AndState {
                    parents: parents.into_iter().collect(),
                    positions_notify,
                    frequency_notify,
                    weight,
                }),
            ),
        };
        Self {
            id: base.id,
            level: base.level,
            frequency: base.frequency,
            null_hyp_freq: base.null_hyp_freq,
            old_null_hyp_freq: base.old_null_hyp_freq,
            is_blocked: base.is_blocked,
            end_required: base.end_required,
            rid_required: base.rid_required,
            frequency_has_changed: base.frequency_has_changed,
            n_offset: base.n_offset,
            size_sum: base.size_sum,
            instance_sum: base.instance_sum,
            and_children: base.children.into_iter().collect(),
            reverse_children: BTreeMap::new(),
            consumers: base.consumers.into_iter().collect(),
            removed: false,
            modified: false,
            kind,
        }
    }
}

impl Suspendable for LatticeNode {
    fn is_modified(&self) -> bool {
        self.modified
    }

    fn clear_modified(&mut self) {
        self.modified = false;
    }

    fn on_reactivate(&mut self) {
        // The reverse child index is derivable and not persisted.
        let entries: Vec<(Refinement, NodeId)> =
            self.and_children.iter().map(|(r, n)| (*r, *n)).collect();
        for (refinement, child) in entries {
            self.reverse_children.insert(
                ReverseRef { node: child, dir: rid_direction(refinement.rid, Some(0)) },
                refinement,
            );
        }
    }

    fn encode(&self) -> std::result::Result<Vec<u8>, serde_cbor::Error> {
        serde_cbor::to_vec(&self.to_snapshot())
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, serde_cbor::Error> {
        Ok(Self::from_snapshot(serde_cbor::from_slice(bytes)?))
    }
}

// ---- the shared lattice ----------------------------------------------------

/// The shared pattern lattice: configuration, node directory, and the global
/// position counter feeding the significance statistics.
pub struct PatternLattice {
    pub(crate) config: Config,
    directory: NodeDirectory<LatticeNode>,
    number_of_positions: AtomicU32,
}

impl PatternLattice {
    /// In-memory lattice; nodes can be discarded but not suspended.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            directory: NodeDirectory::in_memory(),
            number_of_positions: AtomicU32::new(0),
        }
    }

    /// Lattice backed by a suspension store.
    pub fn with_store(config: Config, store: Arc<dyn SuspensionStore>) -> Self {
        let gzip = config.gzip_level;
        Self {
            config,
            directory: NodeDirectory::with_store(store, gzip),
            number_of_positions: AtomicU32::new(0),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The node directory mediating suspension.
    pub fn directory(&self) -> &NodeDirectory<LatticeNode> {
        &self.directory
    }

    /// Shared read access to a node (reactivating it if suspended).
    pub fn read(&self, id: NodeId) -> Result<NodeRef<LatticeNode>> {
        self.directory.read(id)
    }

    /// Exclusive access to a node (reactivating it if suspended).
    pub fn write(&self, id: NodeId) -> Result<NodeRefMut<LatticeNode>> {
        self.directory.write(id)
    }

    /// Advances the global input position counter.
    pub fn add_positions(&self, n: u32) {
        self.number_of_positions.fetch_add(n, Ordering::Relaxed);
    }

    /// Total input positions observed across all sessions.
    pub fn number_of_positions(&self) -> u32 {
        self.number_of_positions.load(Ordering::Relaxed)
    }

    /// Creates a fresh input node (level 1).
    pub fn create_input_node(&self, end_required: bool, rid_required: bool) -> NodeId {
        let id = self.directory.allocate();
        let mut node =
            LatticeNode::new(id, 1, self.number_of_positions(), NodeKind::Input);
        node.end_required = end_required;
        node.rid_required = rid_required;
        self.directory.register(id, node);
        tracing::debug!(node = %id, "created input node");
        id
    }

    /// Registers an external consumer of `id`, keeping it alive through
    /// cleanup.
    pub fn add_consumer(&self, id: NodeId, consumer: u64) -> Result<()> {
        let mut node = self.write(id)?;
        node.consumers.insert(consumer);
        node.modified = true;
        Ok(())
    }

    /// Drops an external consumer registration.
    pub fn remove_consumer(&self, id: NodeId, consumer: u64) -> Result<()> {
        let mut node = self.write(id)?;
        node.consumers.remove(&consumer);
        node.modified = true;
        Ok(())
    }

    /// Child lookup under a short read lock.
    pub fn get_and_child(&self, id: NodeId, refinement: &Refinement) -> Result<Option<NodeId>> {
        Ok(self.read(id)?.and_children.get(refinement).copied())
    }

    /// Is `frequency` over the significance floor?
    pub fn is_frequent(&self, node: &LatticeNode) -> bool {
        node.frequency >= self.config.min_frequency
    }
}
