//! Error taxonomy for the convergence core.
//!
//! Every causal or structural invariant violation is surfaced to the caller
//! rather than recovered locally — silent recovery would break the
//! convergence guarantee. Idempotent duplicates (a change or move that
//! matches already-applied state byte for byte) are absorbed locally and
//! never reach this taxonomy.
//!
//! # Propagation policy
//!
//! - [`CrdtError::MissingDependency`] and [`CrdtError::CausalityViolation`]
//!   are fatal for the offending author's change stream. A sync layer
//!   should stop integrating further changes from that author pending
//!   investigation rather than retrying.
//! - [`CrdtError::CycleDetected`] rejects the move and leaves state
//!   unchanged.
//! - [`CrdtError::DuplicateChange`] and [`CrdtError::DuplicateMove`] are
//!   raised only when re-applied data does *not* match existing state —
//!   a matching re-application is a benign no-op.
//! - [`CrdtError::Internal`] marks a broken internal invariant (state
//!   corruption), distinguished from ordinary bad-input validation so
//!   callers can tell the two apart.

use crate::change::{ChangeId, EntityId};
use crate::clock::Timestamp;
use crate::tree::fracdex::FracdexError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CrdtError>;

/// Errors produced by the convergence core.
#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    /// A change references a dependency that has not been applied yet.
    ///
    /// Never absorbed: accepting the change would corrupt the DAG.
    #[error("missing dependency {dep} of change {change}")]
    MissingDependency { change: ChangeId, dep: ChangeId },

    /// A change's timestamp is behind the author's previously recorded
    /// timestamp, or behind the clock's tracked maximum.
    #[error("change {change} violates causal order: {detail}")]
    CausalityViolation { change: ChangeId, detail: String },

    /// A change was applied to an entity other than the one it targets.
    #[error("change targets entity {got}, but was applied to {want}")]
    EntityMismatch { want: EntityId, got: EntityId },

    /// A change with this ID was already applied with different content.
    #[error("change {change} already applied with different content")]
    DuplicateChange { change: ChangeId },

    /// The local wall clock lags the tracked maximum too far for the
    /// logical counter to bridge. Needs operator or system-clock
    /// intervention.
    #[error("clock skew exceeded: wall clock at {wall_us}us lags tracked maximum {max}")]
    ClockSkewExceeded { wall_us: u64, max: Timestamp },

    /// A move would make a block its own ancestor.
    #[error("cycle detected: block {block} is an ancestor of {parent}")]
    CycleDetected { block: String, parent: String },

    /// A second move for the same `(block, origin)` pair was integrated.
    #[error("duplicate move for block {block} from origin {origin}")]
    DuplicateMove { block: String, origin: String },

    /// A move's arguments are structurally invalid (empty block, unknown
    /// parent or left sibling, left not a child of the parent, and so on).
    #[error("invalid move: {0}")]
    InvalidMove(String),

    /// Malformed `#map`/`#list` tagging or missing required fields in a
    /// patch payload.
    #[error("invalid patch shape: {0}")]
    InvalidPatchShape(String),

    /// Delegated signature verification failed. Propagated unchanged.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Fractional-index key construction failed.
    #[error("fractional index: {0}")]
    Fracdex(#[from] FracdexError),

    /// An internal invariant was violated. Indicates state corruption,
    /// not bad input.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_ids() {
        let err = CrdtError::MissingDependency {
            change: ChangeId::new("b3:aaaa"),
            dep: ChangeId::new("b3:bbbb"),
        };
        let msg = err.to_string();
        assert!(msg.contains("b3:aaaa"));
        assert!(msg.contains("b3:bbbb"));
    }

    #[test]
    fn cycle_error_names_both_blocks() {
        let err = CrdtError::CycleDetected {
            block: "b1".into(),
            parent: "b2".into(),
        };
        assert!(err.to_string().contains("b1"));
        assert!(err.to_string().contains("b2"));
    }
}
