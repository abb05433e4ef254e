//! Conjunct: an incremental pattern-discovery engine over a conjunction
//! lattice, with per-session consistent-interpretation tracking.
//!
//! This crate implements four cooperating components:
//! - A **node directory** mapping integer handles to nodes, mediating
//!   transparent suspension to external storage and reactivation on access.
//! - A **pattern lattice** of input nodes and AND-nodes containing every
//!   tracked substructure of any conjunction, extended incrementally by one
//!   refinement at a time and pruned by significance.
//! - An **activation engine** tracking per-session node firings, their
//!   support relationships, and a worklist that drives propagation of
//!   additions and removals to a fixpoint.
//! - An **interpretation lattice** over interpretation choices, consulted on
//!   every combination to reject self-contradictory sets of choices.
//!
//! Activations are created against pattern-lattice nodes tagged with an
//! interpretation option; propagating them extends both lattices, and all
//! cross-node references travel through directory handles so any node can be
//! suspended mid-traversal without callers noticing.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use conjunct::prelude::*;
//!
//! let lattice = Arc::new(PatternLattice::new(Config::default()));
//! let a = lattice.create_input_node(false, false);
//! let b = lattice.create_input_node(false, false);
//! let ab = lattice
//!     .create_next_level_node(a, Refinement::new(None, b), false)
//!     .unwrap()
//!     .unwrap();
//!
//! let mut session = Session::new(lattice);
//! let oa = session.interp_mut().add_primitive();
//! let ob = session.interp_mut().add_primitive();
//! session
//!     .add_activation_and_propagate(
//!         ActivationKey { node: a, range: Range::new(0, 1), rid: None, option: oa },
//!         &[],
//!     )
//!     .unwrap();
//! session
//!     .add_activation_and_propagate(
//!         ActivationKey { node: b, range: Range::new(1, 2), rid: None, option: ob },
//!         &[],
//!     )
//!     .unwrap();
//! session.process_pending().unwrap();
//! assert_eq!(session.activations_of(ab).len(), 1);
//! ```

pub mod activation;
pub mod config;
pub mod directory;
pub mod error;
pub mod interp;
pub mod pattern;
pub mod session;
pub mod stats;
pub mod suspend;

pub use crate::activation::{ActId, Activation, ActivationKey, NodeWorkingSet, Range};
pub use crate::config::Config;
pub use crate::directory::{NodeDirectory, NodeId, NodeRef, NodeRefMut, Suspendable};
pub use crate::error::{LatticeError, Result};
pub use crate::interp::{InterpId, InterpLattice};
pub use crate::pattern::{LatticeNode, NodeKind, PatternLattice, Refinement};
pub use crate::session::Session;
pub use crate::suspend::{MemoryStore, SuspensionStore};

/// Prelude for convenient usage.
pub mod prelude {
    pub use crate::activation::{ActId, ActivationKey, Range};
    pub use crate::config::Config;
    pub use crate::directory::{NodeDirectory, NodeId, Suspendable};
    pub use crate::error::{LatticeError, Result};
    pub use crate::interp::{InterpId, InterpLattice};
    pub use crate::pattern::{LatticeNode, NodeKind, PatternLattice, Refinement};
    pub use crate::session::Session;
    pub use crate::suspend::{MemoryStore, SuspensionStore};
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::prelude::*;

    fn input_key(
        session: &mut Session,
        node: NodeId,
        begin: u32,
        end: u32,
    ) -> ActivationKey {
        let option = session.interp_mut().add_primitive();
        ActivationKey {
            node,
            range: Range::new(begin, end),
            rid: None,
            option,
        }
    }

    /// Full pipeline: build, fire, propagate, count, score, discover.
    #[test]
    fn end_to_end_discovery_round() {
        let lattice = Arc::new(PatternLattice::new(Config::default()));
        let a = lattice.create_input_node(false, false);
        let b = lattice.create_input_node(false, false);
        let c = lattice.create_input_node(false, false);
        let ab = lattice
            .create_next_level_node(a, Refinement::new(None, b), false)
            .unwrap()
            .unwrap();

        // A handful of sessions, each firing A, B and C over a short window.
        for doc in 0..6u32 {
            let mut session = Session::new(lattice.clone());
            let base = doc * 10;
            for node in [a, b, c] {
                let key = input_key(&mut session, node, base, base + 2);
                session.add_activation_and_propagate(key, &[]).unwrap();
            }
            session.process_pending().unwrap();
            assert_eq!(session.activations_of(ab).len(), 1);

            session.count().unwrap();
            lattice.add_positions(10);

            // Once A and C are frequent, discovery proposes AC (and BC).
            let created = session.discover().unwrap();
            for node in &created {
                assert_eq!(lattice.read(*node).unwrap().level, 2);
            }
            session.update_weights().unwrap();
            session.clear_activations();
        }

        assert!(lattice.read(a).unwrap().frequency >= 5);
        assert!(lattice.read(ab).unwrap().frequency >= 5);
        // Discovery filled in the remaining pairs over {A, B, C}.
        assert!(lattice
            .get_and_child(a, &Refinement::new(None, c))
            .unwrap()
            .is_some());
    }

    /// Suspension in the middle of session processing is invisible.
    #[test]
    fn suspension_is_transparent_to_sessions() {
        let store = Arc::new(MemoryStore::new());
        let lattice = Arc::new(PatternLattice::with_store(
            Config::default(),
            store.clone(),
        ));
        let a = lattice.create_input_node(false, false);
        let b = lattice.create_input_node(false, false);
        let ab = lattice
            .create_next_level_node(a, Refinement::new(None, b), false)
            .unwrap()
            .unwrap();

        lattice.directory().suspend(ab).unwrap();
        assert!(lattice.directory().is_suspended(ab));

        let mut session = Session::new(lattice.clone());
        let ka = input_key(&mut session, a, 0, 1);
        let kb = input_key(&mut session, b, 1, 2);
        session.add_activation_and_propagate(ka, &[]).unwrap();
        session.add_activation_and_propagate(kb, &[]).unwrap();
        session.process_pending().unwrap();

        assert_eq!(session.activations_of(ab).len(), 1);
        assert!(!lattice.directory().is_suspended(ab));
        assert!(store.retrieve_calls() >= 1);
    }
}
