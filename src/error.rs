//! Error types for the lattice engine.
//!
//! Two classes of failure exist and they are deliberately kept apart:
//!
//! - `LatticeError`: failures surfaced to the caller, mostly around the
//!   suspension boundary (store I/O, codec). These carry no retry logic;
//!   a node is neither safely persisted nor reactivated until the call
//!   returns `Ok`.
//! - Rid-window overflow: an internal, recoverable signal (the `Descent`
//!   result in the pattern lattice). A propagation branch whose relational-id
//!   offset leaves the configured window is abandoned locally (treated as
//!   "no such parent/child") and never aborts a session.
//!
//! Structural invariant violations (duplicate refinement insert, double
//! removal, refcount underflow) are programmer errors and fail fast via
//! `assert!`, not through these types.

use crate::directory::NodeId;
use thiserror::Error;

/// Errors surfaced by the engine's public API.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// The external store failed during suspend or reactivate.
    #[error("suspension store i/o failed for node {id}: {source}")]
    Store {
        /// Handle of the affected node.
        id: NodeId,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding a node snapshot failed.
    #[error("snapshot codec failed for node {id}: {source}")]
    Codec {
        /// Handle of the affected node.
        id: NodeId,
        /// Underlying CBOR error.
        #[source]
        source: serde_cbor::Error,
    },

    /// The store holds no bytes for a suspended node.
    #[error("no persisted state for node {0}")]
    MissingState(NodeId),

    /// A handle is not registered in the directory.
    #[error("unknown node handle {0}")]
    UnknownHandle(NodeId),

    /// A suspend was requested but the directory has no store attached.
    #[error("node {0} cannot be suspended without a suspension store")]
    NoStore(NodeId),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LatticeError>;
