//! AND-node construction and maintenance.
//!
//! Extending a node for the refinement set S by one refinement r requires
//! every single-removal subset of S ∪ {r} to exist first; the minimal
//! covering parent set is computed by recursive descent over existing
//! refinement edges, creating missing ancestors on the way (except in
//! discover mode, which never creates ancestors speculatively). The
//! resulting parent table maps each refinement r' to the node for
//! (S ∪ {r}) \ {r'}.
//!
//! # Invariants
//! - All parent write locks are taken in ascending handle order.
//! - The child table is double-checked under the locks, so racing
//!   constructions of the same refinement set converge on one handle.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::Config;
use crate::directory::NodeId;
use crate::error::Result;
use crate::stats;

use super::{
    null_safe_min, LatticeNode, NodeKind, PatternLattice, Refinement,
};

/// Outcome of a covering-parent descent.
enum Descent {
    /// All parents resolved.
    Complete,
    /// A required ancestor is missing (discover mode) or refused creation.
    Incomplete,
    /// A rid offset left the configured window.
    RidOutOfRange(i32),
}

type ParentMap = BTreeMap<Refinement, NodeId>;

impl PatternLattice {
    /// Is `refinement` already part of this node's refinement set?
    ///
    /// A rid of exactly 0 folds onto any non-positive or absent rid for the
    /// same input, because relative position 0 is the base position.
    pub fn contains(&self, id: NodeId, refinement: &Refinement) -> Result<bool> {
        let node = self.read(id)?;
        Ok(match &node.kind {
            NodeKind::Input => {
                refinement.input == node.id && matches!(refinement.rid, None | Some(0))
            }
            NodeKind::And(state) => match refinement.rid {
                None => state.parents.contains_key(refinement),
                Some(r) if r > 0 => state.parents.contains_key(refinement),
                Some(0) => state.parents.keys().any(|p| {
                    matches!(p.rid, None | Some(..=0)) && p.input == refinement.input
                }),
                Some(_) => false,
            },
        })
    }

    /// A node may be extended if (optionally) frequent and still below the
    /// conjunction-size bound.
    pub fn is_expandable(&self, node: &LatticeNode, check_frequency: bool) -> bool {
        if check_frequency && !self.is_frequent(node) {
            return false;
        }
        node.refinement_set().len() < self.config.max_conjunction_size
    }

    /// Returns the node for this node's refinement set extended by
    /// `refinement`, creating it (and any missing ancestors) as needed.
    ///
    /// In discover mode an already existing child means "nothing new" and
    /// yields `None`; missing ancestors are never created and the rid window
    /// is enforced. Returns `None` whenever the extension is refused.
    pub fn create_next_level_node(
        &self,
        base: NodeId,
        refinement: Refinement,
        discover: bool,
    ) -> Result<Option<NodeId>> {
        if let Some(child) = self.get_and_child(base, &refinement)? {
            return Ok(if discover { None } else { Some(child) });
        }
        if self.contains(base, &refinement)? {
            return Ok(None);
        }

        let parents = match self.compute_next_level_parents(base, refinement, discover)? {
            Some(parents) => parents,
            None => return Ok(None),
        };
        if discover && !check_rid_range(&self.config, &parents) {
            return Ok(None);
        }

        let (level, base_blocked) = {
            let node = self.read(base)?;
            (node.level, node.is_blocked)
        };
        let input_blocked = self.read(refinement.input)?.is_blocked;

        // Group refinements per parent handle so each handle is locked once,
        // in ascending order.
        let mut per_parent: BTreeMap<NodeId, Vec<Refinement>> = BTreeMap::new();
        for (r, p) in &parents {
            per_parent.entry(*p).or_default().push(*r);
        }

        let mut guards = Vec::with_capacity(per_parent.len());
        for (&p, refs) in &per_parent {
            guards.push((p, refs, self.write(p)?));
        }

        // Double-check under the locks: another session may have built the
        // same node between the fast path and here.
        for (p, _, guard) in &guards {
            if *p == base {
                if let Some(existing) = guard.and_children.get(&refinement) {
                    return Ok(Some(*existing));
                }
            }
        }

        let id = self.directory().allocate();
        let mut node = LatticeNode::new_and(id, level + 1, self.number_of_positions(), parents);
        node.is_blocked = base_blocked || input_blocked;
        self.directory().register(id, node);

        for (_, refs, guard) in &mut guards {
            for r in refs.iter() {
                guard.add_and_child(*r, id);
            }
        }
        drop(guards);

        tracing::debug!(node = %id, level = level + 1, "created and-node");
        Ok(Some(id))
    }

    /// Minimal covering parent set for `base`'s refinement set plus
    /// `refinement`: each single-refinement removal, offsets renormalized,
    /// mapped to its node.
    fn compute_next_level_parents(
        &self,
        base: NodeId,
        refinement: Refinement,
        discover: bool,
    ) -> Result<Option<ParentMap>> {
        let refinements = {
            let node = self.read(base)?;
            collect_refinements(&node, refinement)
        };

        let mut parents = ParentMap::new();
        let mut visited = HashSet::new();

        for p_ref in &refinements {
            let child_inputs: BTreeSet<Refinement> =
                refinements.iter().filter(|r| *r != p_ref).copied().collect();
            match self.compute_and_parents(
                p_ref.input,
                p_ref.relative_position(),
                &child_inputs,
                &mut parents,
                discover,
                &mut visited,
            )? {
                Descent::Complete => {}
                Descent::Incomplete => return Ok(None),
                Descent::RidOutOfRange(offset) => {
                    tracing::warn!(offset, "rid offset out of range, abandoning extension");
                    return Ok(None);
                }
            }
        }
        Ok(Some(parents))
    }

    /// Descends from `node` through existing refinement edges until a single
    /// refinement remains, recording (last refinement → current node) pairs,
    /// which are exactly the covering parents. Missing intermediate nodes are
    /// created unless in discover mode.
    fn compute_and_parents(
        &self,
        node: NodeId,
        offset: Option<i32>,
        inputs: &BTreeSet<Refinement>,
        parents: &mut ParentMap,
        discover: bool,
        visited: &mut HashSet<(NodeId, Option<i32>)>,
    ) -> Result<Descent> {
        if let Some(off) = offset {
            if !self.config.rid_in_range(off) {
                return Ok(Descent::RidOutOfRange(off));
            }
        }
        if !visited.insert((node, offset)) {
            return Ok(Descent::Complete);
        }

        if let (1, Some(&only)) = (inputs.len(), inputs.iter().next()) {
            parents.insert(only, node);
            return Ok(Descent::Complete);
        }

        for r in inputs {
            let child_inputs: BTreeSet<Refinement> =
                inputs.iter().filter(|c| *c != r).copied().collect();

            let n_ref = Refinement::relative(r.relative_position(), offset, r.input);
            let child = match self.get_and_child(node, &n_ref)? {
                Some(child) => child,
                None => {
                    if discover {
                        return Ok(Descent::Incomplete);
                    }
                    match self.create_next_level_node(node, n_ref, discover)? {
                        Some(child) => child,
                        None => return Ok(Descent::Incomplete),
                    }
                }
            };

            let n_offset = null_safe_min(r.relative_position(), offset);
            match self.compute_and_parents(
                child,
                n_offset,
                &child_inputs,
                parents,
                discover,
                visited,
            )? {
                Descent::Complete => {}
                other => return Ok(other),
            }
        }
        Ok(Descent::Complete)
    }

    // ---- removal and cleanup -----------------------------------------------

    /// Removes a node: children first (recursively), then unlinks it from all
    /// parents. Removal is terminal; the handle stays resolvable but the node
    /// is flagged.
    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        assert!(!self.read(id)?.removed, "node {id} removed twice");

        loop {
            let child = {
                let node = self.read(id)?;
                node.and_children.values().next().copied()
            };
            match child {
                Some(child) => self.remove_node(child)?,
                None => break,
            }
        }

        let parents = {
            let node = self.read(id)?;
            match &node.kind {
                NodeKind::And(state) => state.parents.clone(),
                NodeKind::Input => ParentMap::new(),
            }
        };
        for (r, p) in parents {
            let mut parent = self.write(p)?;
            parent.remove_and_child(&r);
        }

        let mut node = self.write(id)?;
        node.removed = true;
        node.modified = true;
        tracing::debug!(node = %id, "removed node");
        Ok(())
    }

    /// Removes an AND-node that is neither frequent nor externally required,
    /// then reconsiders its parents.
    pub fn cleanup(&self, id: NodeId) -> Result<()> {
        let parents = {
            let node = self.read(id)?;
            if node.removed || node.is_input() {
                return Ok(());
            }
            if self.is_frequent(&node) || node.is_required() {
                return Ok(());
            }
            node.and().parents.clone()
        };

        self.remove_node(id)?;
        for p in parents.values() {
            self.cleanup(*p)?;
        }
        Ok(())
    }

    // ---- significance statistics -------------------------------------------

    /// Refreshes the null-hypothesis frequency estimate: the worst case over
    /// parent pairs of "input fires" times "rest fires", scaled to the number
    /// of observed positions since this node appeared.
    pub fn compute_null_hyp(&self, id: NodeId) -> Result<()> {
        let positions = self.number_of_positions();
        let (parents, size_sum, instance_sum, n_offset) = {
            let node = self.read(id)?;
            match &node.kind {
                NodeKind::Input => return Ok(()),
                NodeKind::And(state) => {
                    (state.parents.clone(), node.size_sum, node.instance_sum, node.n_offset)
                }
            }
        };
        if instance_sum == 0 {
            return Ok(());
        }
        let avg_size = size_sum as f64 / instance_sum as f64;
        let n = (positions - n_offset) as f64 / avg_size;

        let mut null_hyp = 0.0f64;
        for (r, p) in &parents {
            let (p_freq, p_null_hyp, p_offset) = {
                let parent = self.read(*p)?;
                (parent.frequency, parent.null_hyp_freq, parent.n_offset)
            };
            let (in_freq, in_offset) = {
                let input = self.read(r.input)?;
                (input.frequency, input.n_offset)
            };
            let input_na = (positions - in_offset) as f64 / avg_size;
            let input_nb = (positions - p_offset) as f64 / avg_size;
            let nh = (in_freq as f64 / input_na).min(1.0)
                * ((p_freq as f64).max(p_null_hyp) / input_nb).min(1.0);
            null_hyp = null_hyp.max(nh);
        }

        let mut node = self.write(id)?;
        node.null_hyp_freq = null_hyp * n;
        node.modified = true;
        Ok(())
    }

    /// Re-scores the node against the null hypothesis, returning the new
    /// weight when scoring actually ran.
    ///
    /// Scoring is amortized: it is skipped until enough new positions or
    /// firings accumulated since the last pass, unless the null-hypothesis
    /// estimate drifted. `visited` de-duplicates nodes within one scoring
    /// round.
    pub fn update_weight(
        &self,
        id: NodeId,
        visited: &mut HashSet<NodeId>,
    ) -> Result<Option<f64>> {
        let positions = self.number_of_positions();
        {
            let node = self.read(id)?;
            let state = match &node.kind {
                NodeKind::Input => return Ok(None),
                NodeKind::And(state) => state,
            };
            if node.is_blocked
                || positions == node.n_offset
                || node.frequency < self.config.min_frequency
                || node.instance_sum == 0
                || visited.contains(&id)
            {
                return Ok(None);
            }
            if state.positions_notify > positions
                && state.frequency_notify > node.frequency
                && (node.null_hyp_freq - node.old_null_hyp_freq).abs() < 0.01
            {
                return Ok(None);
            }
        }
        visited.insert(id);

        self.compute_null_hyp(id)?;

        let mut node = self.write(id)?;
        let avg_size = node.size_sum as f64 / node.instance_sum as f64;
        let n = (positions - node.n_offset) as f64 / avg_size;
        let frequency = node.frequency;
        let null_hyp_freq = node.null_hyp_freq;

        let weight =
            stats::binomial_cdf(frequency as i64 - 1, n.round() as u64, null_hyp_freq / n);

        node.old_null_hyp_freq = null_hyp_freq;
        let state = node.and_mut();
        state.weight = weight;
        state.positions_notify = stats::notify_increment(n) + positions;
        state.frequency_notify = stats::notify_increment(frequency as f64) + frequency;
        node.modified = true;

        if weight >= self.config.significance_threshold {
            tracing::info!(node = %id, weight, "significant pattern");
        }
        Ok(Some(weight))
    }

    /// The last computed significance weight, negative until first scored.
    pub fn weight(&self, id: NodeId) -> Result<f64> {
        let node = self.read(id)?;
        Ok(match &node.kind {
            NodeKind::Input => -1.0,
            NodeKind::And(state) => state.weight,
        })
    }
}

impl LatticeNode {
    pub(crate) fn new_and(
        id: NodeId,
        level: u32,
        n_offset: u32,
        parents: ParentMap,
    ) -> Self {
        let rid_required = parents.keys().any(|r| r.rid.is_some());
        let mut node = Self::new(
            id,
            level,
            n_offset,
            NodeKind::And(super::AndState {
                parents,
                positions_notify: 0,
                frequency_notify: 0,
                weight: -1.0,
            }),
        );
        node.rid_required = rid_required;
        node
    }
}

/// The refinement set S ∪ {new_ref} as seen from `node`, offsets
/// renormalized relative to the new refinement where rids interact.
fn collect_refinements(node: &LatticeNode, new_ref: Refinement) -> Vec<Refinement> {
    match &node.kind {
        NodeKind::Input => {
            // The base input sits at relative position 0, rebased against the
            // new refinement so each side's child key encodes the partner's
            // rid delta (no rid at all when the new refinement has none).
            let base = Refinement::relative(new_ref.rid.map(|_| 0), new_ref.rid, node.id);
            vec![new_ref, base]
        }
        NodeKind::And(state) => {
            let mut inputs = Vec::with_capacity(state.parents.len() + 1);
            inputs.push(new_ref);

            let num_rid_refs = state.parents.keys().filter(|r| r.rid.is_some()).count();

            for r in state.parents.keys() {
                match (new_ref.rid, r.rid) {
                    (Some(new_rid), _) if new_rid < 0 || num_rid_refs == 1 => {
                        inputs.push(Refinement::relative(
                            r.relative_position(),
                            new_ref.rid,
                            r.input,
                        ));
                    }
                    (Some(_), Some(_)) if r.offset().unwrap_or(0) < 0 => {
                        let offset = (-r.offset().unwrap_or(0))
                            .min(new_ref.relative_position().unwrap_or(0));
                        inputs.push(Refinement::relative(Some(0), Some(offset), r.input));
                    }
                    _ => inputs.push(*r),
                }
            }
            inputs
        }
    }
}

/// Largest positive rid across the parent refinements must stay inside the
/// discovery window.
fn check_rid_range(config: &Config, parents: &ParentMap) -> bool {
    let mut max_rid = 0;
    for r in parents.keys() {
        if let Some(rid) = r.rid {
            max_rid = max_rid.max(rid);
        }
    }
    max_rid < config.max_rid_range
}
