//! Interpretation lattice: consistent combinations of mutually-exclusive
//! choices.
//!
//! Structurally this is a second subset lattice, over interpretation choices
//! instead of input features. A node stands for the conjunction of the
//! primitive choices reachable through its parent chain; a primitive choice
//! is a direct child of the non-removable bottom node. Nodes may additionally
//! carry a disjunction map (source activation → alternative
//! sub-interpretation) whose deepest shared ancestor — the largest common
//! subset — is cached and maintained incrementally.
//!
//! Nodes live in an arena indexed by stable [`InterpId`]; adjacency is
//! explicit id lists, so removing a node and relinking its parents to its
//! children is a bounds-checked rewrite rather than pointer surgery.
//!
//! # Graph coloring
//! Traversals that must visit each node at most once compare a per-purpose
//! stamp on the node against a monotonically increasing counter minted per
//! traversal. Stamps are never reused, so no reset pass is ever needed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activation::ActId;

/// Stable identifier of an interpretation node within its session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InterpId(u32);

impl InterpId {
    /// Creates an id from a raw index.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw index.
    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InterpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Per-purpose traversal stamps. One field per traversal kind keeps the
/// purposes statically known and the checks branch-free.
#[derive(Debug, Default, Clone)]
struct Stamps {
    contains: u64,
    conflicting: u64,
    compute_parents: u64,
    number_inner: u64,
    compute_children: u64,
    lcs: u64,
    link_relations: u64,
    compute_length: u64,
    collect: u64,
}

/// One node of the interpretation lattice.
#[derive(Debug)]
pub struct InterpNode {
    /// Primitive choice id; `None` for combined nodes and bottom.
    prim_id: Option<u32>,
    /// Cached (min, max) primitive-id range, used to prune `contains`.
    prim_range: Option<(u32, u32)>,
    /// Number of primitive choices combined into this node.
    length: u32,
    parents: Vec<InterpId>,
    children: Vec<InterpId>,
    /// Disjunction map: source activation → alternative sub-interpretation.
    or_options: BTreeMap<ActId, InterpId>,
    /// Nodes holding this one in their disjunction map.
    ref_by_or: BTreeSet<InterpId>,
    /// Largest common subset of all disjuncts.
    lcs: Option<InterpId>,
    /// Nodes whose cached LCS points at this one.
    linked_by_lcs: BTreeSet<InterpId>,
    /// Direct conflict mark, populated by external negative feedback.
    conflict: bool,
    /// Activations committed to this option.
    activations: BTreeSet<ActId>,
    ref_count: u32,
    removed: bool,
    stamps: Stamps,
    // Traversal counters paired with the stamps above.
    number_inner_inputs: usize,
    lcs_count: usize,
    children_input_count: usize,
}

impl InterpNode {
    fn new(prim_id: Option<u32>, length: u32) -> Self {
        Self {
            prim_id,
            prim_range: prim_id.map(|p| (p, p)),
            length,
            parents: Vec::new(),
            children: Vec::new(),
            or_options: BTreeMap::new(),
            ref_by_or: BTreeSet::new(),
            lcs: None,
            linked_by_lcs: BTreeSet::new(),
            conflict: false,
            activations: BTreeSet::new(),
            ref_count: 0,
            removed: false,
            stamps: Stamps::default(),
            number_inner_inputs: 0,
            lcs_count: 0,
            children_input_count: 0,
        }
    }

    /// Number of primitive choices combined into this node.
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Current reference count.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether this node has been removed from the lattice.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Conflicts only propagate through nodes without committed activations.
    fn conflicts_allowed(&self) -> bool {
        self.activations.is_empty()
    }
}

/// Per-session interpretation lattice.
pub struct InterpLattice {
    arena: Vec<InterpNode>,
    bottom: InterpId,
    visited: u64,
}

impl Default for InterpLattice {
    fn default() -> Self {
        Self::new()
    }
}

impl InterpLattice {
    /// Creates a lattice holding only the bottom (empty) interpretation.
    pub fn new() -> Self {
        let bottom = InterpId::new(0);
        Self {
            arena: vec![InterpNode::new(None, 0)],
            bottom,
            visited: 1,
        }
    }

    /// The empty interpretation. Never reference counted, never removed.
    pub fn bottom(&self) -> InterpId {
        self.bottom
    }

    /// Immutable access to a node.
    pub fn node(&self, id: InterpId) -> &InterpNode {
        &self.arena[id.raw() as usize]
    }

    fn node_mut(&mut self, id: InterpId) -> &mut InterpNode {
        &mut self.arena[id.raw() as usize]
    }

    fn next_stamp(&mut self) -> u64 {
        let v = self.visited;
        self.visited += 1;
        v
    }

    /// True for the empty interpretation.
    pub fn is_bottom(&self, id: InterpId) -> bool {
        self.node(id).length == 0
    }

    /// Parent ids (each one primitive choice shorter), ascending insertion
    /// order.
    pub fn parents(&self, id: InterpId) -> &[InterpId] {
        &self.node(id).parents
    }

    /// Child ids.
    pub fn children(&self, id: InterpId) -> &[InterpId] {
        &self.node(id).children
    }

    /// Cached largest common subset of this node's disjuncts.
    pub fn largest_common_subset(&self, id: InterpId) -> Option<InterpId> {
        self.node(id).lcs
    }

    fn alloc(&mut self, prim_id: Option<u32>, length: u32) -> InterpId {
        let id = InterpId::new(self.arena.len() as u32);
        self.arena.push(InterpNode::new(prim_id, length));
        id
    }

    /// Mints a fresh primitive choice directly under bottom.
    pub fn add_primitive(&mut self) -> InterpId {
        let prim = self.node(self.bottom).children.len() as u32;
        let id = self.alloc(Some(prim), 1);
        self.count_ref(id);
        self.add_link(self.bottom, id);
        id
    }

    // ---- reference counting ------------------------------------------------

    /// Takes a reference on `id`. Bottom is never counted.
    pub fn count_ref(&mut self, id: InterpId) {
        if self.is_bottom(id) {
            return;
        }
        self.node_mut(id).ref_count += 1;
    }

    /// Releases a reference; removes the node when the count reaches zero.
    ///
    /// # Panics
    /// Panics when releasing below zero.
    pub fn release_ref(&mut self, id: InterpId) {
        if self.is_bottom(id) {
            return;
        }
        let node = self.node_mut(id);
        assert!(node.ref_count > 0, "release_ref below zero on {id}");
        node.ref_count -= 1;
        if node.ref_count == 0 {
            self.remove(id);
        }
    }

    /// Unlinks `id`, reconnecting its parents directly to its children so
    /// lattice connectivity is preserved. Edges already implied transitively
    /// are not duplicated.
    fn remove(&mut self, id: InterpId) {
        assert!(!self.node(id).removed, "double removal of {id}");
        self.node_mut(id).removed = true;

        let parents = std::mem::take(&mut self.node_mut(id).parents);
        let children = std::mem::take(&mut self.node_mut(id).children);
        for &p in &parents {
            self.node_mut(p).children.retain(|&c| c != id);
        }
        for &c in &children {
            self.node_mut(c).parents.retain(|&p| p != id);
        }
        for &p in &parents {
            for &c in &children {
                let v = self.next_stamp();
                if !self.is_linked(c, p, v) {
                    self.add_link(p, c);
                }
            }
        }

        if let Some(lcs) = self.node_mut(id).lcs.take() {
            self.node_mut(lcs).linked_by_lcs.remove(&id);
            self.release_ref(lcs);
        }
    }

    /// Ancestor test used during relinking: is `anchor` reachable upward
    /// from `id`?
    fn is_linked(&mut self, id: InterpId, anchor: InterpId, v: u64) -> bool {
        if id == anchor {
            return true;
        }
        self.node_mut(id).stamps.contains = v;
        if self.node(id).length < self.node(anchor).length {
            return false;
        }
        let parents = self.node(id).parents.clone();
        for p in parents {
            if self.node(p).stamps.contains != v && self.is_linked(p, anchor, v) {
                return true;
            }
        }
        false
    }

    fn add_link(&mut self, parent: InterpId, child: InterpId) {
        self.node_mut(parent).children.push(child);
        self.node_mut(child).parents.push(parent);
    }

    fn remove_link(&mut self, parent: InterpId, child: InterpId) {
        self.node_mut(parent).children.retain(|&c| c != child);
        self.node_mut(child).parents.retain(|&p| p != parent);
    }

    // ---- add: the central operation ---------------------------------------

    /// Combines `inputs` into a single interpretation node, reusing any
    /// existing node that already represents the union.
    ///
    /// With `non_conflicting`, a conflicting covering parent (transitively,
    /// memoized per traversal) aborts the whole operation; `None` means the
    /// combination of choices is inconsistent and must be discarded.
    ///
    /// The returned node carries one fresh reference.
    pub fn add(&mut self, non_conflicting: bool, inputs: &[InterpId]) -> Option<InterpId> {
        let mut inputs: Vec<InterpId> =
            inputs.iter().copied().filter(|&n| !self.is_bottom(n)).collect();

        if inputs.is_empty() {
            return Some(self.bottom);
        }
        if inputs.len() == 1 || (inputs.len() == 2 && inputs[0] == inputs[1]) {
            let n = inputs[0];
            if non_conflicting && self.is_conflicting(n) {
                return None;
            }
            self.count_ref(n);
            return Some(n);
        }

        let (parents, children) = self.compute_relations(&mut inputs);

        if parents.len() == 1 {
            let n = parents[0];
            if non_conflicting && self.is_conflicting(n) {
                return None;
            }
            self.count_ref(n);
            return Some(n);
        }

        if non_conflicting {
            for &p in &parents {
                if self.is_conflicting(p) {
                    return None;
                }
            }
        }

        let id = self.alloc(None, 0);
        let v = self.next_stamp();
        self.link_relations(id, &parents, &children, v);

        let v = self.next_stamp();
        self.node_mut(id).length = 0;
        let length = self.compute_length(id, v);
        self.node_mut(id).length = length;

        let mut min_prim = u32::MAX;
        let mut max_prim = 0;
        for &n in &inputs {
            if let Some((lo, hi)) = self.node(n).prim_range {
                min_prim = min_prim.min(lo);
                max_prim = max_prim.max(hi);
            }
        }
        if min_prim <= max_prim {
            self.node_mut(id).prim_range = Some((min_prim, max_prim));
        }

        self.count_ref(id);
        Some(id)
    }

    /// Computes the minimal covering ancestor set ("parents") of the union of
    /// `inputs` and the minimal set of existing nodes already covered by the
    /// union ("children"). Two stamped passes: the first counts, per inner
    /// node, how many of its parents lie inside the walk; the second collects
    /// frontier nodes.
    fn compute_relations(
        &mut self,
        inputs: &mut Vec<InterpId>,
    ) -> (Vec<InterpId>, Vec<InterpId>) {
        let mut parent_results = Vec::new();
        let mut children_results = Vec::new();

        // Longest first; id breaks ties for determinism.
        inputs.sort_by(|&a, &b| {
            self.node(b)
                .length
                .cmp(&self.node(a).length)
                .then_with(|| a.cmp(&b))
        });

        let s = inputs.len();
        if s == 2
            && self.node(inputs[1]).prim_id.is_some()
            && self.node(inputs[1]).children.is_empty()
        {
            return (inputs.clone(), children_results);
        }

        let mut v = self.next_stamp();
        for pass in 0..=1 {
            for &n in inputs.iter() {
                self.compute_parents_walk(n, v, pass, &mut parent_results);
            }
            if pass == 0 {
                v = self.next_stamp();
            }
        }
        let nv = v;

        if parent_results.len() == 1 {
            return (parent_results, children_results);
        }
        assert!(!parent_results.is_empty(), "covering parent set is empty");

        for &n in inputs.iter() {
            let v = self.next_stamp();
            self.compute_children_walk(n, v, nv, s, 0, &mut children_results);
        }
        let v = self.next_stamp();
        self.compute_children_walk(inputs[0], v, nv, s, 1, &mut children_results);

        (parent_results, children_results)
    }

    fn compute_parents_walk(
        &mut self,
        id: InterpId,
        v: u64,
        pass: u8,
        results: &mut Vec<InterpId>,
    ) {
        if self.node(id).stamps.compute_parents == v || self.node(id).length == 0 {
            return;
        }
        self.node_mut(id).stamps.compute_parents = v;

        let parents = self.node(id).parents.clone();
        for p in parents {
            self.compute_parents_walk(p, v, pass, results);
        }

        let children = self.node(id).children.clone();
        let mut frontier = true;
        for c in children {
            if pass == 0 {
                let cn = self.node_mut(c);
                if cn.stamps.number_inner != v {
                    cn.number_inner_inputs = 0;
                    cn.stamps.number_inner = v;
                }
                cn.number_inner_inputs += 1;
            }
            if self.node(c).number_inner_inputs == self.node(c).parents.len() {
                self.compute_parents_walk(c, v, pass, results);
                frontier = false;
            }
        }

        if frontier && pass == 1 {
            results.push(id);
        }
    }

    fn compute_children_walk(
        &mut self,
        id: InterpId,
        v: u64,
        nv: u64,
        s: usize,
        pass: u8,
        results: &mut Vec<InterpId>,
    ) {
        if self.node(id).stamps.compute_children == v {
            return;
        }
        if pass == 0 {
            let n = self.node_mut(id);
            if n.stamps.compute_children <= nv {
                n.children_input_count = 0;
            }
            n.children_input_count += 1;
        }
        self.node_mut(id).stamps.compute_children = v;

        if pass == 1 && self.node(id).children_input_count == s {
            let parents = self.node(id).parents.clone();
            let covered = parents
                .iter()
                .any(|&p| self.node(p).children_input_count == s);
            if !covered {
                results.push(id);
            }
        } else {
            let children = self.node(id).children.clone();
            for c in children {
                self.compute_children_walk(c, v, nv, s, pass, results);
            }
        }
    }

    /// Links the new node under its covering parents and over its covered
    /// children, then drops parent→child edges now represented transitively
    /// through the new node.
    fn link_relations(
        &mut self,
        id: InterpId,
        parents: &[InterpId],
        children: &[InterpId],
        v: u64,
    ) {
        for &p in parents {
            self.add_link(p, id);
        }
        for &c in children {
            self.node_mut(c).stamps.link_relations = v;
            self.add_link(id, c);
        }
        for &p in parents {
            let bypassed: Vec<InterpId> = self
                .node(p)
                .children
                .iter()
                .copied()
                .filter(|&c| c != id && self.node(c).stamps.link_relations == v)
                .collect();
            for c in bypassed {
                self.remove_link(p, c);
            }
        }
    }

    fn compute_length(&mut self, id: InterpId, v: u64) -> u32 {
        if self.node(id).stamps.compute_length == v {
            return 0;
        }
        self.node_mut(id).stamps.compute_length = v;

        if self.node(id).prim_id.is_some() {
            return 1;
        }
        let parents = self.node(id).parents.clone();
        let mut result = 0;
        for p in parents {
            result += self.compute_length(p, v);
        }
        result
    }

    // ---- disjunctions and the largest common subset ------------------------

    /// Adds a disjunctive alternative under the source activation
    /// `input_act`, maintaining the largest common subset incrementally.
    /// Takes a reference on `alt` for as long as it stays registered.
    pub fn add_or_option(&mut self, id: InterpId, input_act: ActId, alt: InterpId) {
        self.count_ref(alt);
        self.compute_lcs_incremental(id, alt);
        self.node_mut(id).or_options.insert(input_act, alt);
        self.node_mut(alt).ref_by_or.insert(id);
    }

    /// Removes a disjunctive alternative and recomputes the largest common
    /// subset from scratch.
    pub fn remove_or_option(&mut self, id: InterpId, input_act: ActId, alt: InterpId) {
        self.node_mut(id).or_options.remove(&input_act);
        self.node_mut(alt).ref_by_or.remove(&id);
        self.compute_lcs_full(id);
        self.release_ref(alt);
    }

    /// Replaces the cached LCS. Takes over one reference on the new value
    /// and drops the reference held on the old one.
    fn set_lcs(&mut self, id: InterpId, lcs: Option<InterpId>) {
        let old = self.node(id).lcs;
        if let Some(old) = old {
            self.node_mut(old).linked_by_lcs.remove(&id);
        }
        self.node_mut(id).lcs = lcs;
        if let Some(new) = lcs {
            self.node_mut(new).linked_by_lcs.insert(id);
        }
        if let Some(old) = old {
            self.release_ref(old);
        }
    }

    /// Fast path: O(existing LCS + new disjunct) instead of O(all disjuncts).
    fn compute_lcs_incremental(&mut self, id: InterpId, new_opt: InterpId) {
        if self.node(id).or_options.is_empty() {
            self.count_ref(new_opt);
            self.set_lcs(id, Some(new_opt));
            return;
        }
        let v_min = self.next_stamp();
        let mut results = Vec::new();
        if let Some(lcs) = self.node(id).lcs {
            let v = self.next_stamp();
            self.compute_lcs_step(lcs, &mut results, v, v_min, 2, 0);
        }
        let v = self.next_stamp();
        self.compute_lcs_step(new_opt, &mut results, v, v_min, 2, 0);
        let lcs = self.add(true, &results);
        self.set_lcs(id, lcs);
    }

    fn compute_lcs_full(&mut self, id: InterpId) {
        let disjuncts: Vec<InterpId> = self.node(id).or_options.values().copied().collect();
        let s = disjuncts.len();
        let v_min = self.next_stamp();
        let mut results = Vec::new();
        for d in disjuncts {
            let v = self.next_stamp();
            self.compute_lcs_step(d, &mut results, v, v_min, s, 0);
        }
        let lcs = if results.is_empty() {
            None
        } else {
            self.add(true, &results)
        };
        self.set_lcs(id, lcs);
    }

    fn compute_lcs_step(
        &mut self,
        id: InterpId,
        results: &mut Vec<InterpId>,
        v: u64,
        v_min: u64,
        s: usize,
        depth: u32,
    ) {
        if self.node(id).stamps.lcs == v {
            return;
        }
        if self.node(id).stamps.lcs <= v_min {
            self.node_mut(id).lcs_count = 0;
        }
        self.node_mut(id).stamps.lcs = v;
        self.node_mut(id).lcs_count += 1;

        if depth > 10 {
            return;
        }
        if self.node(id).lcs_count == s {
            results.push(id);
            return;
        }

        let parents = self.node(id).parents.clone();
        for p in parents {
            self.compute_lcs_step(p, results, v, v_min, s, depth + 1);
        }
        if let Some(lcs) = self.node(id).lcs {
            self.compute_lcs_step(lcs, results, v, v_min, s, depth + 1);
        }
    }

    // ---- conflicts ---------------------------------------------------------

    /// Sets or clears the direct conflict mark (populated by external
    /// negative-feedback logic; only consulted here).
    pub fn set_conflict(&mut self, id: InterpId, conflict: bool) {
        self.node_mut(id).conflict = conflict;
    }

    /// A node is conflicting if directly marked, or if any ancestor is —
    /// but a node with committed activations no longer propagates conflicts
    /// from its ancestors.
    pub fn is_conflicting(&mut self, id: InterpId) -> bool {
        let v = self.next_stamp();
        self.is_conflicting_walk(id, v)
    }

    fn is_conflicting_walk(&mut self, id: InterpId, v: u64) -> bool {
        if self.node(id).conflict {
            return true;
        }
        if self.node(id).conflicts_allowed() {
            if self.node(id).stamps.conflicting == v {
                return false;
            }
            self.node_mut(id).stamps.conflicting = v;

            let parents = self.node(id).parents.clone();
            for p in parents {
                if self.is_conflicting_walk(p, v) {
                    return true;
                }
            }
        }
        false
    }

    // ---- containment -------------------------------------------------------

    /// Does `id` contain `other` (is `other` an ancestor of `id`)?
    ///
    /// Pruned by the cached primitive-id ranges; with `follow_lcs`,
    /// containment may also pass through cached largest-common-subset links.
    pub fn contains(&mut self, id: InterpId, other: InterpId, follow_lcs: bool) -> bool {
        let v = self.next_stamp();
        self.contains_walk(id, other, follow_lcs, v)
    }

    fn contains_walk(
        &mut self,
        id: InterpId,
        other: InterpId,
        follow_lcs: bool,
        v: u64,
    ) -> bool {
        self.node_mut(id).stamps.contains = v;

        if id == other || self.is_bottom(other) {
            return true;
        }
        if !follow_lcs && self.node(id).length <= self.node(other).length {
            return false;
        }

        let other_range = self.node(other).prim_range;
        let parents = self.node(id).parents.clone();
        for p in parents {
            let overlap = match (self.node(p).prim_range, other_range) {
                (Some((p_lo, p_hi)), Some((o_lo, o_hi))) => o_hi >= p_lo && o_lo <= p_hi,
                _ => true,
            };
            if overlap
                && self.node(p).stamps.contains != v
                && self.contains_walk(p, other, follow_lcs, v)
            {
                return true;
            }
        }

        if follow_lcs {
            if let Some(lcs) = self.node(id).lcs {
                if self.contains_walk(lcs, other, follow_lcs, v) {
                    return true;
                }
            }
        }
        false
    }

    // ---- activation hooks --------------------------------------------------

    /// Records that an activation committed to this option.
    pub fn register_activation(&mut self, id: InterpId, act: ActId) {
        self.node_mut(id).activations.insert(act);
    }

    /// Withdraws a committed activation.
    pub fn unregister_activation(&mut self, id: InterpId, act: ActId) {
        self.node_mut(id).activations.remove(&act);
    }

    /// Primitive choice ids reachable from `id`, ascending.
    pub fn collect_primitives(&mut self, id: InterpId) -> BTreeSet<u32> {
        let v = self.next_stamp();
        let mut out = BTreeSet::new();
        self.collect_walk(id, v, &mut out);
        out
    }

    fn collect_walk(&mut self, id: InterpId, v: u64, out: &mut BTreeSet<u32>) {
        if self.node(id).stamps.collect == v {
            return;
        }
        self.node_mut(id).stamps.collect = v;
        if let Some(p) = self.node(id).prim_id {
            out.insert(p);
        } else {
            let parents = self.node(id).parents.clone();
            for p in parents {
                self.collect_walk(p, v, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice_with_prims(n: usize) -> (InterpLattice, Vec<InterpId>) {
        let mut lat = InterpLattice::new();
        let prims = (0..n).map(|_| lat.add_primitive()).collect();
        (lat, prims)
    }

    #[test]
    fn bottom_is_never_counted() {
        let mut lat = InterpLattice::new();
        let bottom = lat.bottom();
        lat.count_ref(bottom);
        lat.release_ref(bottom);
        assert!(!lat.node(bottom).is_removed());
        assert_eq!(lat.node(bottom).ref_count(), 0);
    }

    #[test]
    fn add_empty_yields_bottom() {
        let mut lat = InterpLattice::new();
        let bottom = lat.bottom();
        assert_eq!(lat.add(true, &[]), Some(bottom));
        assert_eq!(lat.add(true, &[bottom, bottom]), Some(bottom));
    }

    #[test]
    fn add_combines_primitives() {
        let (mut lat, p) = lattice_with_prims(2);
        let ab = lat.add(true, &[p[0], p[1]]).unwrap();
        assert_eq!(lat.node(ab).length(), 2);
        assert!(lat.contains(ab, p[0], false));
        assert!(lat.contains(ab, p[1], false));
        assert!(!lat.contains(p[0], ab, false));

        let prims = lat.collect_primitives(ab);
        assert_eq!(prims.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn add_is_idempotent_through_covering_parent() {
        let (mut lat, p) = lattice_with_prims(2);
        let ab1 = lat.add(true, &[p[0], p[1]]).unwrap();
        let ab2 = lat.add(true, &[p[0], p[1]]).unwrap();
        assert_eq!(ab1, ab2);
        assert_eq!(lat.node(ab1).ref_count(), 2);
    }

    #[test]
    fn minimal_parent_set_for_merge() {
        let (mut lat, p) = lattice_with_prims(3);
        let ab = lat.add(true, &[p[0], p[1]]).unwrap();
        let ac = lat.add(true, &[p[0], p[2]]).unwrap();
        let abc = lat.add(true, &[ab, ac]).unwrap();

        assert_eq!(lat.node(abc).length(), 3);
        let mut parents = lat.parents(abc).to_vec();
        parents.sort();
        let mut expected = vec![ab, ac];
        expected.sort();
        assert_eq!(parents, expected);

        // The union is found again rather than recreated.
        let again = lat.add(true, &[ab, ac]).unwrap();
        assert_eq!(again, abc);
    }

    #[test]
    fn ref_counting_removes_at_zero() {
        let (mut lat, p) = lattice_with_prims(2);
        let ab = lat.add(true, &[p[0], p[1]]).unwrap();
        lat.count_ref(ab);
        lat.count_ref(ab);
        // Three references now (one from add).
        lat.release_ref(ab);
        lat.release_ref(ab);
        assert!(!lat.node(ab).is_removed());
        lat.release_ref(ab);
        assert!(lat.node(ab).is_removed());
    }

    #[test]
    #[should_panic(expected = "release_ref below zero")]
    fn release_below_zero_panics() {
        let (mut lat, p) = lattice_with_prims(2);
        let ab = lat.add(true, &[p[0], p[1]]).unwrap();
        lat.release_ref(ab);
        lat.release_ref(ab);
    }

    #[test]
    fn removal_relinks_parents_to_children() {
        let (mut lat, p) = lattice_with_prims(3);
        let ab = lat.add(true, &[p[0], p[1]]).unwrap();
        let ac = lat.add(true, &[p[0], p[2]]).unwrap();
        let abc = lat.add(true, &[ab, ac]).unwrap();
        assert!(lat.children(ab).contains(&abc));

        // Dropping ab relinks its parents (p0, p1) directly to abc.
        lat.release_ref(ab);
        assert!(lat.node(ab).is_removed());
        assert!(lat.parents(abc).contains(&ac));
        assert!(
            lat.parents(abc).contains(&p[0]) || lat.parents(abc).contains(&p[1]),
            "connectivity must be preserved through relinking"
        );
        // abc still contains all three primitives.
        assert!(lat.contains(abc, p[0], false));
        assert!(lat.contains(abc, p[1], false));
    }

    #[test]
    fn conflict_blocks_add() {
        let (mut lat, p) = lattice_with_prims(2);
        lat.set_conflict(p[0], true);
        assert_eq!(lat.add(true, &[p[0], p[1]]), None);
        // Without the check the combination goes through.
        assert!(lat.add(false, &[p[0], p[1]]).is_some());
    }

    #[test]
    fn conflict_propagates_to_descendants_and_clears() {
        let (mut lat, p) = lattice_with_prims(2);
        let ab = lat.add(false, &[p[0], p[1]]).unwrap();

        lat.set_conflict(p[0], true);
        assert!(lat.is_conflicting(p[0]));
        assert!(lat.is_conflicting(ab));
        assert!(!lat.is_conflicting(p[1]));

        // Committed activations stop propagation from ancestors.
        lat.register_activation(ab, ActId(1));
        assert!(!lat.is_conflicting(ab));
        lat.unregister_activation(ab, ActId(1));
        assert!(lat.is_conflicting(ab));

        lat.set_conflict(p[0], false);
        assert!(!lat.is_conflicting(ab));
        assert!(!lat.is_conflicting(p[0]));
    }

    #[test]
    fn or_options_track_largest_common_subset() {
        let (mut lat, p) = lattice_with_prims(3);
        let ab = lat.add(true, &[p[0], p[1]]).unwrap();
        let ac = lat.add(true, &[p[0], p[2]]).unwrap();

        let holder = lat.add(true, &[p[1], p[2]]).unwrap();
        lat.add_or_option(holder, ActId(1), ab);
        // Single disjunct: LCS is the disjunct itself.
        assert_eq!(lat.largest_common_subset(holder), Some(ab));

        lat.add_or_option(holder, ActId(2), ac);
        // Common subset of ab and ac is a (p0).
        assert_eq!(lat.largest_common_subset(holder), Some(p[0]));

        lat.remove_or_option(holder, ActId(2), ac);
        assert_eq!(lat.largest_common_subset(holder), Some(ab));
    }

    #[test]
    fn contains_pruned_by_prim_ranges() {
        let (mut lat, p) = lattice_with_prims(4);
        let ab = lat.add(true, &[p[0], p[1]]).unwrap();
        let cd = lat.add(true, &[p[2], p[3]]).unwrap();
        assert!(!lat.contains(ab, cd, false));
        assert!(!lat.contains(cd, ab, false));
        assert!(lat.contains(cd, p[3], false));
    }
}
