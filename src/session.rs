//! Per-session activation processing.
//!
//! A session owns everything that is document-scoped: the activation arena,
//! the per-node working sets with their ordering views, the interpretation
//! lattice, and the worklist driving
//! propagation. The pattern lattice itself is shared and only read/extended
//! through its own locks; nothing session-scoped ever leaks into it except
//! the frequency counters updated by [`Session::count`].
//!
//! Activations are never mutated in place for add/remove. Requests accumulate
//! per node (added key → input set, removed key → withdrawn inputs) and
//! [`Session::process_pending`] drains the dirty-node worklist to a fixpoint:
//! removals cancel against re-adds of the same key, support is re-checked
//! before anything is actually dropped, removals run before additions, and
//! each processed node may enqueue further nodes.
//!
//! # Option ownership
//! Every activation key owns one reference on its interpretation option.
//! `add_activation_and_propagate` takes that reference over; the session
//! releases it when the add collapses onto an existing activation, when an
//! AND-level gate drops the request, when the activation is removed, and at
//! teardown in [`Session::clear_activations`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::activation::{
    Activation, ActivationKey, ActId, ByBegin, NodeWorkingSet, Range, RemovedEntry,
};
use crate::directory::NodeId;
use crate::error::Result;
use crate::interp::{InterpId, InterpLattice};
use crate::pattern::{
    null_safe_add, null_safe_min, null_safe_sub, NodeKind, PatternLattice, Refinement,
};

/// One processing session (a document) against a shared pattern lattice.
pub struct Session {
    lattice: Arc<PatternLattice>,
    interp: InterpLattice,
    acts: HashMap<ActId, Activation>,
    next_act: u64,
    working: HashMap<NodeId, NodeWorkingSet>,
    queue: BinaryHeap<Reverse<NodeId>>,
    dirty: HashSet<NodeId>,
    /// Nodes that currently have registered activations.
    activated: BTreeSet<NodeId>,
    /// Session-wide rid index. An activation appears here iff its rid is
    /// non-null.
    by_rid: BTreeSet<(i32, ActId)>,
}

impl Session {
    pub fn new(lattice: Arc<PatternLattice>) -> Self {
        Self {
            lattice,
            interp: InterpLattice::new(),
            acts: HashMap::new(),
            next_act: 0,
            working: HashMap::new(),
            queue: BinaryHeap::new(),
            dirty: HashSet::new(),
            activated: BTreeSet::new(),
            by_rid: BTreeSet::new(),
        }
    }

    /// The shared pattern lattice this session runs against.
    pub fn lattice(&self) -> &PatternLattice {
        &self.lattice
    }

    /// This session's interpretation lattice.
    pub fn interp(&self) -> &InterpLattice {
        &self.interp
    }

    pub fn interp_mut(&mut self) -> &mut InterpLattice {
        &mut self.interp
    }

    /// Looks up an activation by id (removed activations stay resolvable).
    pub fn activation(&self, id: ActId) -> Option<&Activation> {
        self.acts.get(&id)
    }

    /// Registered activations of `node` in begin order.
    pub fn activations_of(&self, node: NodeId) -> Vec<ActId> {
        self.working
            .get(&node)
            .map(|ws| ws.iter().map(|(_, id)| id).collect())
            .unwrap_or_default()
    }

    /// The registered activation for `key`, if any.
    pub fn activation_for(&self, key: &ActivationKey) -> Option<ActId> {
        self.working.get(&key.node).and_then(|ws| ws.get(key))
    }

    fn act(&self, id: ActId) -> &Activation {
        match self.acts.get(&id) {
            Some(act) => act,
            None => panic!("unknown activation {}", id.0),
        }
    }

    fn act_mut(&mut self, id: ActId) -> &mut Activation {
        match self.acts.get_mut(&id) {
            Some(act) => act,
            None => panic!("unknown activation {}", id.0),
        }
    }

    fn working_mut(&mut self, node: NodeId) -> Result<&mut NodeWorkingSet> {
        if !self.working.contains_key(&node) {
            let (end_required, rid_required) = {
                let n = self.lattice.read(node)?;
                (n.end_required, n.rid_required)
            };
            self.working
                .insert(node, NodeWorkingSet::new(end_required, rid_required));
        }
        match self.working.get_mut(&node) {
            Some(ws) => Ok(ws),
            None => unreachable!(),
        }
    }

    fn enqueue(&mut self, node: NodeId) {
        if self.dirty.insert(node) {
            self.queue.push(Reverse(node));
        }
    }

    // ---- request side ------------------------------------------------------

    /// Queues a new activation for `key` supported by `inputs`. Takes over
    /// one reference on `key.option`. Nothing happens until
    /// [`Session::process_pending`] runs.
    pub fn add_activation_and_propagate(
        &mut self,
        key: ActivationKey,
        inputs: &[ActId],
    ) -> Result<()> {
        let ws = self.working_mut(key.node)?;
        match ws.added.get_mut(&ByBegin(key)) {
            Some(set) => {
                set.extend(inputs.iter().copied());
                // A batch entry for this key already owns an option
                // reference; fold the surplus one.
                self.interp.release_ref(key.option);
            }
            None => {
                ws.added
                    .insert(ByBegin(key), inputs.iter().copied().collect());
            }
        }
        self.enqueue(key.node);
        Ok(())
    }

    /// Queues withdrawal of `inputs` from `act`; the activation itself is
    /// dropped only if support fails once the batch is processed.
    pub fn remove_activation_and_propagate(&mut self, act: ActId, inputs: &[ActId]) {
        let key = match self.acts.get(&act) {
            Some(a) if !a.removed => a.key,
            _ => return,
        };
        let ws = match self.working.get_mut(&key.node) {
            Some(ws) => ws,
            None => return,
        };
        let entry = ws.removed.entry(ByBegin(key)).or_insert_with(|| RemovedEntry {
            act,
            inputs: BTreeSet::new(),
        });
        entry.inputs.extend(inputs.iter().copied());
        self.enqueue(key.node);
    }

    // ---- worklist ----------------------------------------------------------

    /// Drains the worklist to a fixpoint.
    pub fn process_pending(&mut self) -> Result<()> {
        while let Some(Reverse(node)) = self.queue.pop() {
            if !self.dirty.remove(&node) {
                continue;
            }
            self.process_changes(node)?;
        }
        Ok(())
    }

    /// Processes one node's accumulated batches.
    fn process_changes(&mut self, node: NodeId) -> Result<()> {
        let (added, mut removed) = {
            let ws = self.working_mut(node)?;
            (std::mem::take(&mut ws.added), std::mem::take(&mut ws.removed))
        };

        // A removal whose key was re-added in the same batch is a no-op.
        removed.retain(|k, _| {
            !added.keys().any(|a| {
                a.0.option == k.0.option && a.0.rid == k.0.rid && a.0.range == k.0.range
            })
        });

        // Mark first, then process, so removal side effects observe a graph
        // in which all fellow removals are already visible.
        for re in removed.values() {
            if !self.has_support(re.act)? {
                self.act_mut(re.act).removed = true;
            }
        }
        for re in removed.values().cloned().collect::<Vec<_>>() {
            self.process_removed(&re)?;
        }
        for (key, inputs) in added {
            self.process_added(key.0, &inputs)?;
        }
        Ok(())
    }

    /// Distinct live supporting parent nodes must cover the node's full
    /// parent count; duplicate inputs from the same parent count once.
    fn has_support(&self, act: ActId) -> Result<bool> {
        let act = self.act(act);
        let node = self.lattice.read(act.key.node)?;
        Ok(match &node.kind {
            NodeKind::Input => act.inputs.iter().any(|i| !self.act(*i).removed),
            NodeKind::And(state) => {
                let expected = state.parents.len();
                let mut support = BTreeSet::new();
                for &i in &act.inputs {
                    let input = self.act(i);
                    if !input.removed {
                        support.insert(input.key.node);
                    }
                }
                assert!(support.len() <= expected, "support exceeds parent count");
                support.len() == expected
            }
        })
    }

    fn process_removed(&mut self, re: &RemovedEntry) -> Result<()> {
        if self.act(re.act).removed {
            self.unregister(re.act)?;
            self.propagate_removed_activation(re.act);
            let option = self.act(re.act).key.option;
            self.interp.release_ref(option);
        }
        for &i in &re.inputs {
            self.act_mut(re.act).inputs.remove(&i);
            if let Some(input) = self.acts.get_mut(&i) {
                input.outputs.remove(&re.act);
            }
        }
        Ok(())
    }

    fn process_added(&mut self, key: ActivationKey, inputs: &BTreeSet<ActId>) -> Result<()> {
        let (is_and, level) = {
            let node = self.lattice.read(key.node)?;
            (!node.is_input(), node.level)
        };
        // An AND activation needs exactly one live input per conjunct.
        if is_and {
            let live = inputs.iter().filter(|i| !self.act(**i).removed).count();
            if live as u32 != level {
                self.interp.release_ref(key.option);
                return Ok(());
            }
        }

        match self.activation_for(&key) {
            Some(existing) => {
                self.link(existing, inputs);
                self.interp.release_ref(key.option);
            }
            None => {
                let id = self.mint(key);
                self.register(id)?;
                self.link(id, inputs);
                self.propagate_added_activation(id, None)?;
            }
        }
        Ok(())
    }

    fn mint(&mut self, key: ActivationKey) -> ActId {
        let id = ActId(self.next_act);
        self.next_act += 1;
        self.acts.insert(id, Activation::new(id, key));
        id
    }

    fn link(&mut self, act: ActId, inputs: &BTreeSet<ActId>) {
        for &i in inputs {
            self.act_mut(act).inputs.insert(i);
            self.act_mut(i).outputs.insert(act);
        }
    }

    fn register(&mut self, act: ActId) -> Result<()> {
        let key = self.act(act).key;
        let ws = self.working_mut(key.node)?;
        ws.insert(key, act);
        if let Some(rid) = key.rid {
            self.by_rid.insert((rid, act));
        }
        self.interp.register_activation(key.option, act);
        self.activated.insert(key.node);
        Ok(())
    }

    fn unregister(&mut self, act: ActId) -> Result<()> {
        let key = self.act(act).key;
        let ws = self.working_mut(key.node)?;
        ws.remove(&key);
        let empty = ws.is_empty();
        if let Some(rid) = key.rid {
            self.by_rid.remove(&(rid, act));
        }
        self.interp.unregister_activation(key.option, act);
        if empty {
            self.activated.remove(&key.node);
        }
        Ok(())
    }

    // ---- propagation -------------------------------------------------------

    /// Propagates a registered activation to the next level, pairing it with
    /// sibling activations through the lattice's child tables. When
    /// `reexpand_under` is set (re-expansion after a conflict was resolved),
    /// only combinations whose option covers that node are admitted.
    pub fn propagate_added_activation(
        &mut self,
        act: ActId,
        reexpand_under: Option<InterpId>,
    ) -> Result<()> {
        if self.act(act).removed {
            return Ok(());
        }
        let is_input = {
            let node = self.lattice.read(self.act(act).key.node)?;
            node.is_input()
        };
        if is_input {
            self.apply_input(act, reexpand_under)
        } else {
            self.apply_and(act, reexpand_under)
        }
    }

    /// Cascades support withdrawal to every dependent activation.
    fn propagate_removed_activation(&mut self, act: ActId) {
        let outputs: Vec<ActId> = self.act(act).outputs.iter().copied().collect();
        for out in outputs {
            self.remove_activation_and_propagate(out, &[act]);
        }
    }

    /// Pairing from an input-node activation: each child entry names the
    /// missing partner input, and its rid is the partner's delta relative to
    /// this activation.
    fn apply_input(&mut self, act: ActId, reexpand_under: Option<InterpId>) -> Result<()> {
        let key = self.act(act).key;
        let children: Vec<(Refinement, NodeId)> = {
            let node = self.lattice.read(key.node)?;
            node.and_children.iter().map(|(r, c)| (*r, *c)).collect()
        };

        for (r, child) in children {
            let partners: Vec<ActId> = match null_safe_add(key.rid, r.rid) {
                Some(target) => self.acts_with_rid(r.input, target),
                None => self.activations_of(r.input),
            };
            for second in partners {
                if second == act || self.act(second).removed {
                    continue;
                }
                self.add_next_level_activation(act, second, child, reexpand_under)?;
            }
        }
        Ok(())
    }

    /// Pairing from an AND-node activation: walk its input activations,
    /// resolve both reverse refinements through the shared parent, and look
    /// up the combined child.
    fn apply_and(&mut self, act: ActId, reexpand_under: Option<InterpId>) -> Result<()> {
        let key = self.act(act).key;
        let inputs: Vec<ActId> = self.act(act).inputs.iter().copied().collect();

        for p_act in inputs {
            let p_key = self.act(p_act).key;
            let siblings: Vec<ActId> = self.act(p_act).outputs.iter().copied().collect();

            let mut pairs = Vec::new();
            {
                let parent = self.lattice.read(p_key.node)?;
                let Some(own_ref) =
                    parent.reverse_refinement(key.node, key.rid, p_key.rid)
                else {
                    continue;
                };
                for second in siblings {
                    if second == act || self.act(second).removed {
                        continue;
                    }
                    let s_key = self.act(second).key;
                    if let Some(s_ref) =
                        parent.reverse_refinement(s_key.node, s_key.rid, p_key.rid)
                    {
                        let n_ref =
                            Refinement::relative(s_ref.rid, own_ref.offset(), s_ref.input);
                        pairs.push((second, n_ref));
                    }
                }
            }

            for (second, n_ref) in pairs {
                if let Some(next) = self.lattice.get_and_child(key.node, &n_ref)? {
                    self.add_next_level_activation(act, second, next, reexpand_under)?;
                }
            }
        }
        Ok(())
    }

    /// Combines two sibling activations into a next-level request: merged
    /// range, min-combined rid, and a consistent combined option (the
    /// interpretation lattice rejecting the combination kills the request).
    fn add_next_level_activation(
        &mut self,
        first: ActId,
        second: ActId,
        node: NodeId,
        reexpand_under: Option<InterpId>,
    ) -> Result<()> {
        let k1 = self.act(first).key;
        let k2 = self.act(second).key;

        let option = match self.interp.add(true, &[k1.option, k2.option]) {
            Some(option) => option,
            None => return Ok(()),
        };
        if let Some(under) = reexpand_under {
            if !self.interp.contains(option, under, false) {
                self.interp.release_ref(option);
                return Ok(());
            }
        }

        let key = ActivationKey {
            node,
            range: Range::merge(k1.range, k2.range),
            rid: null_safe_min(k1.rid, k2.rid),
            option,
        };
        self.add_activation_and_propagate(key, &[first, second])
    }

    /// All registered activations carrying exactly `rid`, across nodes.
    pub fn activations_at_rid(&self, rid: i32) -> Vec<ActId> {
        self.by_rid
            .range((rid, ActId(0))..=(rid, ActId(u64::MAX)))
            .map(|(_, id)| *id)
            .collect()
    }

    /// Keyed activations of `node` carrying exactly `rid`.
    pub fn acts_with_rid(&self, node: NodeId, rid: i32) -> Vec<ActId> {
        self.working
            .get(&node)
            .map(|ws| ws.with_rid(rid))
            .unwrap_or_default()
    }

    // ---- discovery ---------------------------------------------------------

    /// Speculative pattern discovery over all live activations: pairs
    /// frequent, expandable nodes without creating missing ancestors.
    /// Returns the newly created nodes.
    pub fn discover(&mut self) -> Result<Vec<NodeId>> {
        let mut created = Vec::new();
        let mut ids: Vec<ActId> = self
            .acts
            .values()
            .filter(|a| !a.removed)
            .map(|a| a.id)
            .collect();
        ids.sort();
        for id in ids {
            if self.acts.get(&id).map(|a| a.removed).unwrap_or(true) {
                continue;
            }
            self.discover_from(id, &mut created)?;
        }
        Ok(created)
    }

    fn discover_from(&mut self, act: ActId, created: &mut Vec<NodeId>) -> Result<()> {
        let key = self.act(act).key;
        let is_input = {
            let node = self.lattice.read(key.node)?;
            if !self.lattice.is_expandable(&node, true) {
                return Ok(());
            }
            node.is_input()
        };
        if is_input {
            self.discover_from_input(act, created)
        } else {
            self.discover_from_and(act, created)
        }
    }

    /// Level-1 discovery: pair with any other live input-node activation
    /// within the rid window.
    fn discover_from_input(&mut self, act: ActId, created: &mut Vec<NodeId>) -> Result<()> {
        let key = self.act(act).key;
        let max_rid_range = self.lattice.config().max_rid_range;

        let mut partners: Vec<ActId> =
            self.acts.values().filter(|a| !a.removed).map(|a| a.id).collect();
        partners.sort();

        for second in partners {
            if second == act {
                continue;
            }
            let s_key = self.act(second).key;
            {
                let node = self.lattice.read(s_key.node)?;
                if !node.is_input() || node.is_blocked || !self.lattice.is_frequent(&node) {
                    continue;
                }
            }
            if let Some(delta) = null_safe_sub(key.rid, s_key.rid) {
                if delta >= max_rid_range {
                    continue;
                }
            }
            let n_ref = Refinement::relative(s_key.rid, key.rid, s_key.node);
            if let Some(node) = self.lattice.create_next_level_node(key.node, n_ref, true)? {
                created.push(node);
            }
        }
        Ok(())
    }

    /// AND-level discovery: pair with frequent AND siblings through a shared
    /// input activation.
    fn discover_from_and(&mut self, act: ActId, created: &mut Vec<NodeId>) -> Result<()> {
        let key = self.act(act).key;
        let max_rid_range = self.lattice.config().max_rid_range;
        let inputs: Vec<ActId> = self.act(act).inputs.iter().copied().collect();

        for p_act in inputs {
            let p_key = self.act(p_act).key;
            let siblings: Vec<ActId> = self.act(p_act).outputs.iter().copied().collect();

            let own_ref = {
                let parent = self.lattice.read(p_key.node)?;
                parent.reverse_refinement(key.node, key.rid, p_key.rid)
            };
            let Some(own_ref) = own_ref else {
                continue;
            };

            for second in siblings {
                if second == act || self.act(second).removed {
                    continue;
                }
                let s_key = self.act(second).key;
                {
                    let node = self.lattice.read(s_key.node)?;
                    if node.is_input() || node.is_blocked || !self.lattice.is_frequent(&node)
                    {
                        continue;
                    }
                }
                if let Some(delta) = null_safe_sub(key.rid, s_key.rid) {
                    if delta >= max_rid_range {
                        continue;
                    }
                }
                let s_ref = {
                    let parent = self.lattice.read(p_key.node)?;
                    parent.reverse_refinement(s_key.node, s_key.rid, p_key.rid)
                };
                let Some(s_ref) = s_ref else {
                    continue;
                };
                let n_ref = Refinement::relative(s_ref.rid, own_ref.offset(), s_ref.input);
                if let Some(node) =
                    self.lattice.create_next_level_node(key.node, n_ref, true)?
                {
                    created.push(node);
                }
            }
        }
        Ok(())
    }

    // ---- statistics and teardown -------------------------------------------

    /// Folds this session's registered activations into the shared frequency
    /// counters. Call once per session, after processing settled.
    pub fn count(&mut self) -> Result<()> {
        let nodes: Vec<NodeId> = self.activated.iter().copied().collect();
        for node_id in nodes {
            let keys: Vec<ActivationKey> = self
                .working
                .get(&node_id)
                .map(|ws| ws.iter().map(|(k, _)| *k).collect())
                .unwrap_or_default();
            if keys.is_empty() {
                continue;
            }
            let mut node = self.lattice.write(node_id)?;
            for key in &keys {
                node.frequency += 1;
                node.frequency_has_changed = true;
                node.size_sum += key.range.width();
                node.instance_sum += 1;
            }
            node.modified = true;
        }
        Ok(())
    }

    /// One scoring round over all nodes that fired in this session.
    pub fn update_weights(&mut self) -> Result<()> {
        let mut visited = HashSet::new();
        let nodes: Vec<NodeId> = self.activated.iter().copied().collect();
        for node in nodes {
            self.lattice.update_weight(node, &mut visited)?;
        }
        Ok(())
    }

    /// Drops all session activation state. Each registered key's option
    /// reference is released, so interpretation nodes kept alive only by
    /// activations are destroyed here rather than with the session.
    pub fn clear_activations(&mut self) {
        let working = std::mem::take(&mut self.working);
        for ws in working.values() {
            for (key, act) in ws.iter() {
                self.interp.unregister_activation(key.option, act);
                self.interp.release_ref(key.option);
            }
        }
        self.acts.clear();
        self.queue.clear();
        self.dirty.clear();
        self.activated.clear();
        self.by_rid.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn setup() -> (Arc<PatternLattice>, NodeId, NodeId) {
        let lattice = Arc::new(PatternLattice::new(Config::default()));
        let a = lattice.create_input_node(false, false);
        let b = lattice.create_input_node(false, false);
        (lattice, a, b)
    }

    fn input_key(session: &mut Session, node: NodeId, begin: u32, end: u32) -> ActivationKey {
        let option = session.interp_mut().add_primitive();
        ActivationKey {
            node,
            range: Range::new(begin, end),
            rid: None,
            option,
        }
    }

    #[test]
    fn input_pair_produces_and_activation() {
        let (lattice, a, b) = setup();
        let rb = Refinement::new(None, b);
        let ab = lattice.create_next_level_node(a, rb, false).unwrap().unwrap();

        let mut session = Session::new(lattice);
        let ka = input_key(&mut session, a, 0, 1);
        let kb = input_key(&mut session, b, 1, 2);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.process_pending().unwrap();

        let acts = session.activations_of(ab);
        assert_eq!(acts.len(), 1);
        let act = session.activation(acts[0]).unwrap();
        assert_eq!(act.key.range, Range::new(0, 2));
        assert_eq!(act.key.rid, None);
        assert_eq!(act.inputs.len(), 2);
        // The combined option covers both primitives.
        assert_eq!(session.interp().node(act.key.option).length(), 2);
    }

    #[test]
    fn rid_alignment_selects_the_partner() {
        let lattice = Arc::new(PatternLattice::new(Config::default()));
        let a = lattice.create_input_node(false, true);
        let b = lattice.create_input_node(false, true);
        let ab = lattice
            .create_next_level_node(a, Refinement::new(Some(1), b), false)
            .unwrap()
            .unwrap();

        let mut session = Session::new(lattice);
        let oa = session.interp_mut().add_primitive();
        let ob1 = session.interp_mut().add_primitive();
        let ob2 = session.interp_mut().add_primitive();
        let key = |node, begin, end, rid, option| ActivationKey {
            node,
            range: Range::new(begin, end),
            rid: Some(rid),
            option,
        };
        session
            .add_activation_and_propagate(key(a, 0, 1, 3, oa), &[])
            .unwrap();
        session
            .add_activation_and_propagate(key(b, 1, 2, 4, ob1), &[])
            .unwrap();
        session
            .add_activation_and_propagate(key(b, 5, 6, 9, ob2), &[])
            .unwrap();
        session.process_pending().unwrap();

        // Only the rid-4 partner pairs with the rid-3 base.
        let acts = session.activations_of(ab);
        assert_eq!(acts.len(), 1);
        let act = session.activation(acts[0]).unwrap();
        assert_eq!(act.key.rid, Some(3));
        assert_eq!(act.key.range, Range::new(0, 2));
    }

    #[test]
    fn conflicting_options_never_combine() {
        let (lattice, a, b) = setup();
        let rb = Refinement::new(None, b);
        let ab = lattice.create_next_level_node(a, rb, false).unwrap().unwrap();

        let mut session = Session::new(lattice);
        let ka = input_key(&mut session, a, 0, 1);
        let kb = input_key(&mut session, b, 1, 2);
        session.interp_mut().set_conflict(ka.option, true);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.process_pending().unwrap();

        assert!(session.activations_of(ab).is_empty());
        // The inputs themselves still fired.
        assert_eq!(session.activations_of(a).len(), 1);
        assert_eq!(session.activations_of(b).len(), 1);
    }

    #[test]
    fn duplicate_parent_inputs_count_once() {
        let (lattice, a, b) = setup();
        let rb = Refinement::new(None, b);
        let ab = lattice.create_next_level_node(a, rb, false).unwrap().unwrap();

        let mut session = Session::new(lattice.clone());
        let ka1 = input_key(&mut session, a, 0, 1);
        let ka2 = input_key(&mut session, a, 1, 2);
        let kb = input_key(&mut session, b, 0, 2);
        session.add_activation_and_propagate(ka1, &[]).unwrap();
        session.add_activation_and_propagate(ka2, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.process_pending().unwrap();

        let ia1 = session.activation_for(&ka1).unwrap();
        let ia2 = session.activation_for(&ka2).unwrap();
        let ib = session.activation_for(&kb).unwrap();

        // Build one AND activation carrying both a-inputs: first create it
        // with one pair, then link the second a-input onto the same key.
        let key_ab = ActivationKey {
            node: ab,
            range: Range::new(0, 2),
            rid: None,
            option: session.interp().bottom(),
        };
        session.add_activation_and_propagate(key_ab, &[ia1, ib]).unwrap();
        session.process_pending().unwrap();
        session.add_activation_and_propagate(key_ab, &[ia2, ib]).unwrap();
        session.process_pending().unwrap();

        let and_act = session.activation_for(&key_ab).unwrap();
        assert_eq!(session.activation(and_act).unwrap().inputs.len(), 3);

        // Removing one of the two duplicate-parent inputs keeps support at 2.
        session.remove_activation_and_propagate(ia1, &[]);
        session.process_pending().unwrap();
        assert!(session.activation(ia1).unwrap().removed);
        assert!(!session.activation(and_act).unwrap().removed);
        assert_eq!(session.activation_for(&key_ab), Some(and_act));

        // Removing the second one drops support below the parent count.
        session.remove_activation_and_propagate(ia2, &[]);
        session.process_pending().unwrap();
        assert!(session.activation(and_act).unwrap().removed);
        assert_eq!(session.activation_for(&key_ab), None);
    }

    #[test]
    fn readd_in_same_batch_cancels_removal() {
        let (lattice, a, _) = setup();
        let mut session = Session::new(lattice);
        let ka = input_key(&mut session, a, 0, 3);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.process_pending().unwrap();
        let act = session.activation_for(&ka).unwrap();

        session.remove_activation_and_propagate(act, &[]);
        // Re-adding the same key in the same batch cancels the removal. The
        // re-add hands over a fresh option reference.
        session.interp_mut().count_ref(ka.option);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.process_pending().unwrap();

        assert!(!session.activation(act).unwrap().removed);
        assert_eq!(session.activation_for(&ka), Some(act));
    }

    #[test]
    fn removal_cascades_to_dependents() {
        let (lattice, a, b) = setup();
        let rb = Refinement::new(None, b);
        let ab = lattice.create_next_level_node(a, rb, false).unwrap().unwrap();

        let mut session = Session::new(lattice);
        let ka = input_key(&mut session, a, 0, 1);
        let kb = input_key(&mut session, b, 1, 2);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.process_pending().unwrap();
        assert_eq!(session.activations_of(ab).len(), 1);

        let ia = session.activation_for(&ka).unwrap();
        session.remove_activation_and_propagate(ia, &[]);
        session.process_pending().unwrap();

        assert!(session.activations_of(ab).is_empty());
        assert!(session.activations_of(a).is_empty());
        assert_eq!(session.activations_of(b).len(), 1);
    }

    #[test]
    fn discovery_builds_the_pair_node_once() {
        let (lattice, a, b) = setup();
        for id in [a, b] {
            lattice.write(id).unwrap().frequency = 10;
        }

        let mut session = Session::new(lattice.clone());
        let ka = input_key(&mut session, a, 0, 1);
        let kb = input_key(&mut session, b, 1, 2);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.process_pending().unwrap();

        let created = session.discover().unwrap();
        assert_eq!(created.len(), 1);
        let node = lattice.read(created[0]).unwrap();
        assert_eq!(node.level, 2);

        // A second round discovers nothing new.
        assert!(session.discover().unwrap().is_empty());
    }

    #[test]
    fn rid_index_mirrors_registration() {
        let lattice = Arc::new(PatternLattice::new(Config::default()));
        let a = lattice.create_input_node(false, true);
        let b = lattice.create_input_node(false, true);

        let mut session = Session::new(lattice);
        let oa = session.interp_mut().add_primitive();
        let ob = session.interp_mut().add_primitive();
        let oc = session.interp_mut().add_primitive();
        let ka = ActivationKey {
            node: a,
            range: Range::new(0, 1),
            rid: Some(2),
            option: oa,
        };
        let kb = ActivationKey {
            node: b,
            range: Range::new(1, 2),
            rid: Some(2),
            option: ob,
        };
        let kc = ActivationKey {
            node: a,
            range: Range::new(3, 4),
            rid: None,
            option: oc,
        };
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.add_activation_and_propagate(kc, &[]).unwrap();
        session.process_pending().unwrap();

        // Null-rid activations never enter the index.
        assert_eq!(session.activations_at_rid(2).len(), 2);
        assert!(session.activations_at_rid(0).is_empty());

        let ia = session.activation_for(&ka).unwrap();
        session.remove_activation_and_propagate(ia, &[]);
        session.process_pending().unwrap();
        assert_eq!(session.activations_at_rid(2).len(), 1);

        session.clear_activations();
        assert!(session.activations_at_rid(2).is_empty());
    }

    #[test]
    fn count_accumulates_frequency() {
        let (lattice, a, _) = setup();
        let mut session = Session::new(lattice.clone());
        let k1 = input_key(&mut session, a, 0, 4);
        let k2 = input_key(&mut session, a, 6, 7);
        session.add_activation_and_propagate(k1, &[]).unwrap();
        session.add_activation_and_propagate(k2, &[]).unwrap();
        session.process_pending().unwrap();

        session.count().unwrap();
        let node = lattice.read(a).unwrap();
        assert_eq!(node.frequency, 2);
        assert_eq!(node.size_sum, 5); // widths 4 and 1
        assert_eq!(node.instance_sum, 2);
        assert!(node.frequency_has_changed);

        session.clear_activations();
        assert!(session.activations_of(a).is_empty());
    }

    #[test]
    fn teardown_releases_option_references() {
        let (lattice, a, b) = setup();
        let rb = Refinement::new(None, b);
        let ab = lattice.create_next_level_node(a, rb, false).unwrap().unwrap();

        let mut session = Session::new(lattice);
        let ka = input_key(&mut session, a, 0, 1);
        let kb = input_key(&mut session, b, 1, 2);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.process_pending().unwrap();

        let combined = session
            .activation(session.activations_of(ab)[0])
            .unwrap()
            .key
            .option;

        // Options are alive only through their activation keys; teardown
        // drops those references and the nodes with them.
        session.clear_activations();
        assert!(session.interp().node(combined).is_removed());
        assert!(session.interp().node(ka.option).is_removed());
        assert!(session.interp().node(kb.option).is_removed());
        let bottom = session.interp().bottom();
        assert!(!session.interp().node(bottom).is_removed());
    }
}
