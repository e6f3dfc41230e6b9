//! Convergence engine for a local-first, peer-to-peer hypermedia
//! platform.
//!
//! Documents are replicated as entities: append-only DAGs of signed,
//! content-addressed [`Change`] blobs. Replicas that hold the same
//! changes converge to the same state, whatever order the changes
//! arrived in. The pieces:
//!
//! - [`clock`] — hybrid logical clock; totally ordered `u64` timestamps.
//! - [`change`] — signed change blobs and their BLAKE3 content IDs.
//! - [`entity`] — the causal DAG, heads, and version handling.
//! - [`merge_map`] — path-addressed last-writer-wins registers and
//!   append-only lists.
//! - [`tree`] — move-based ordered block tree with fractional indexing.
//! - [`document`] — editing sessions folding edits into single changes.
//! - [`signer`] / [`store`] — pluggable signing and persistence seams.
//!
//! # Conventions
//!
//! - **Errors**: every fallible operation returns [`Result`] with the
//!   [`CrdtError`] taxonomy; invariant violations are surfaced, never
//!   recovered silently.
//! - **Logging**: `tracing` macros, no output sinks configured here.

pub mod canonical;
pub mod change;
pub mod clock;
pub mod document;
pub mod entity;
pub mod error;
pub mod merge_map;
pub mod signer;
pub mod store;
pub mod tree;

pub use change::{Change, ChangeId, EntityId};
pub use clock::{Clock, MAX_SKEW_US, Timestamp};
pub use document::{Block, BlockNode, Document, DocumentView};
pub use entity::Entity;
pub use error::{CrdtError, Result};
pub use merge_map::{MergeMap, RegisterValue};
pub use signer::{AuthorId, Keypair, Signer};
pub use store::{ChangeStore, MemStore, load_entity};
pub use tree::{MoveEffect, OpId, TRASH, TreeCrdt, TreeMutation};
