//! Activations: per-session firings of lattice nodes.
//!
//! An activation is keyed by (node, range, relational id, interpretation
//! option) and unique per key within its session. Activations are never
//! mutated in place for add/remove; each node accumulates pending-added and
//! pending-removed batches which the session's worklist drains (see
//! `session`).
//!
//! # Ordering views
//! Three orderings over the same key are maintained per node:
//! - by range begin (always)
//! - by range end (only when the node requires end indexing)
//! - by relational id (only when the node requires rid indexing)
//!
//! Different lookups use different views: pairing a partner whose range
//! starts where mine ends walks the begin view, the mirrored search walks the
//! end view, and rid-aligned pairing walks the rid view.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::directory::NodeId;
use crate::interp::InterpId;

/// Half-open numeric range `[begin, end)` over input positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    /// Inclusive start position.
    pub begin: u32,
    /// Exclusive end position.
    pub end: u32,
}

impl Range {
    /// Creates a range. `end` must not precede `begin`.
    pub fn new(begin: u32, end: u32) -> Self {
        debug_assert!(begin <= end, "inverted range");
        Self { begin, end }
    }

    /// Smallest range covering both operands.
    pub fn merge(a: Range, b: Range) -> Range {
        Range {
            begin: a.begin.min(b.begin),
            end: a.end.max(b.end),
        }
    }

    /// Width used by the statistics accumulators, clamped to at least one.
    pub fn width(&self) -> u32 {
        (self.end - self.begin).max(1)
    }

    fn cmp_begin_first(&self, other: &Range) -> Ordering {
        (self.begin, self.end).cmp(&(other.begin, other.end))
    }

    fn cmp_end_first(&self, other: &Range) -> Ordering {
        (self.end, self.begin).cmp(&(other.end, other.begin))
    }
}

/// Session-local activation identifier, minted monotonically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ActId(pub u64);

/// Key identifying one activation within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationKey {
    /// Node this activation fired on.
    pub node: NodeId,
    /// Covered input range.
    pub range: Range,
    /// Optional relational id (positional tag).
    pub rid: Option<i32>,
    /// Interpretation option tagging this activation.
    pub option: InterpId,
}

/// `None < Some(_)`, then by value; the total order for optional rids.
pub fn cmp_rid(a: Option<i32>, b: Option<i32>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

impl ActivationKey {
    /// Begin-first total order: range (begin, end), rid, option.
    pub fn cmp_begin(&self, other: &Self) -> Ordering {
        self.range
            .cmp_begin_first(&other.range)
            .then_with(|| cmp_rid(self.rid, other.rid))
            .then_with(|| self.option.cmp(&other.option))
    }

    /// End-first total order: range (end, begin), rid, option.
    pub fn cmp_end(&self, other: &Self) -> Ordering {
        self.range
            .cmp_end_first(&other.range)
            .then_with(|| cmp_rid(self.rid, other.rid))
            .then_with(|| self.option.cmp(&other.option))
    }

    /// Rid-first total order: rid, range (begin, end), option.
    pub fn cmp_by_rid(&self, other: &Self) -> Ordering {
        cmp_rid(self.rid, other.rid)
            .then_with(|| self.range.cmp_begin_first(&other.range))
            .then_with(|| self.option.cmp(&other.option))
    }
}

macro_rules! ordered_key {
    ($name:ident, $cmp:ident) => {
        /// Ordering wrapper so the same key can live in differently sorted maps.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub ActivationKey);

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                self.0.$cmp(&other.0)
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
    };
}

ordered_key!(ByBegin, cmp_begin);
ordered_key!(ByEnd, cmp_end);
ordered_key!(ByRid, cmp_by_rid);

/// A node firing within one session.
#[derive(Debug, Clone)]
pub struct Activation {
    /// Session-local id.
    pub id: ActId,
    /// Identifying key.
    pub key: ActivationKey,
    /// Input activations this one depends on (its support).
    pub inputs: BTreeSet<ActId>,
    /// Derived activations depending on this one.
    pub outputs: BTreeSet<ActId>,
    /// Set when support was withdrawn and the activation is logically gone.
    pub removed: bool,
}

impl Activation {
    pub(crate) fn new(id: ActId, key: ActivationKey) -> Self {
        Self {
            id,
            key,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            removed: false,
        }
    }
}

/// Pending removal of one activation together with the withdrawn inputs.
#[derive(Debug, Clone)]
pub struct RemovedEntry {
    /// The activation whose support is being withdrawn.
    pub act: ActId,
    /// Inputs withdrawn by this batch.
    pub inputs: BTreeSet<ActId>,
}

/// Per-node activation bookkeeping inside one session.
#[derive(Debug, Default)]
pub struct NodeWorkingSet {
    /// Primary view, by range begin.
    pub by_begin: BTreeMap<ByBegin, ActId>,
    /// End view, present iff the node requires end indexing.
    pub by_end: Option<BTreeMap<ByEnd, ActId>>,
    /// Rid view, present iff the node requires rid indexing.
    pub by_rid: Option<BTreeMap<ByRid, ActId>>,
    /// Pending additions: key → accumulated input activations.
    pub added: BTreeMap<ByBegin, BTreeSet<ActId>>,
    /// Pending removals: key → removed entry.
    pub removed: BTreeMap<ByBegin, RemovedEntry>,
}

impl NodeWorkingSet {
    /// Creates a working set with the views the node requires.
    pub fn new(end_required: bool, rid_required: bool) -> Self {
        Self {
            by_begin: BTreeMap::new(),
            by_end: end_required.then(BTreeMap::new),
            by_rid: rid_required.then(BTreeMap::new),
            added: BTreeMap::new(),
            removed: BTreeMap::new(),
        }
    }

    /// Looks up the activation registered under `key`, if any.
    pub fn get(&self, key: &ActivationKey) -> Option<ActId> {
        self.by_begin.get(&ByBegin(*key)).copied()
    }

    /// Registers `id` under `key` in every maintained view.
    pub fn insert(&mut self, key: ActivationKey, id: ActId) {
        self.by_begin.insert(ByBegin(key), id);
        if let Some(by_end) = &mut self.by_end {
            by_end.insert(ByEnd(key), id);
        }
        if let Some(by_rid) = &mut self.by_rid {
            by_rid.insert(ByRid(key), id);
        }
    }

    /// Removes `key` from every maintained view.
    pub fn remove(&mut self, key: &ActivationKey) {
        self.by_begin.remove(&ByBegin(*key));
        if let Some(by_end) = &mut self.by_end {
            by_end.remove(&ByEnd(*key));
        }
        if let Some(by_rid) = &mut self.by_rid {
            by_rid.remove(&ByRid(*key));
        }
    }

    /// True when no activation is registered.
    pub fn is_empty(&self) -> bool {
        self.by_begin.is_empty()
    }

    /// All registered activations in begin order.
    pub fn iter(&self) -> impl Iterator<Item = (&ActivationKey, ActId)> {
        self.by_begin.iter().map(|(k, id)| (&k.0, *id))
    }

    /// Activations whose range begins at `pos` (begin view).
    pub fn with_begin(&self, pos: u32) -> Vec<ActId> {
        self.by_begin
            .iter()
            .skip_while(move |(k, _)| k.0.range.begin < pos)
            .take_while(move |(k, _)| k.0.range.begin == pos)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Activations whose range ends at `pos` (end view; falls back to a scan
    /// of the begin view when end indexing was not requested).
    pub fn with_end(&self, pos: u32) -> Vec<ActId> {
        match &self.by_end {
            Some(by_end) => by_end
                .iter()
                .skip_while(move |(k, _)| k.0.range.end < pos)
                .take_while(move |(k, _)| k.0.range.end == pos)
                .map(|(_, id)| *id)
                .collect(),
            None => self
                .by_begin
                .iter()
                .filter(|(k, _)| k.0.range.end == pos)
                .map(|(_, id)| *id)
                .collect(),
        }
    }

    /// Activations carrying exactly `rid` (rid view; scan fallback).
    pub fn with_rid(&self, rid: i32) -> Vec<ActId> {
        match &self.by_rid {
            Some(by_rid) => by_rid
                .iter()
                .skip_while(move |(k, _)| cmp_rid(k.0.rid, Some(rid)) == Ordering::Less)
                .take_while(move |(k, _)| k.0.rid == Some(rid))
                .map(|(_, id)| *id)
                .collect(),
            None => self
                .by_begin
                .iter()
                .filter(|(k, _)| k.0.rid == Some(rid))
                .map(|(_, id)| *id)
                .collect(),
        }
    }
}
