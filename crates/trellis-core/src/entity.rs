//! Replicated entity: an append-only DAG of signed changes.
//!
//! An [`Entity`] accumulates [`Change`] blobs and folds their payloads
//! into a [`MergeMap`]. Changes form a causal DAG through their `deps`
//! lists; the childless changes are the *heads* and name the entity's
//! current version. Applying the same set of changes in any
//! causally-valid order yields the same state.
//!
//! Validation is all-or-nothing: a change that fails any check leaves
//! the entity untouched.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::change::{Change, ChangeId, EntityId};
use crate::clock::{Clock, Timestamp};
use crate::error::{CrdtError, Result};
use crate::merge_map::MergeMap;
use crate::signer::{AuthorId, Signer};

/// A CRDT object identified by [`EntityId`], materialized from changes.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    /// Change IDs in application order, parallel to `changes`.
    cids: Vec<ChangeId>,
    changes: Vec<Change>,
    /// DAG edges by application index, both directions.
    deps: Vec<Vec<usize>>,
    rdeps: Vec<Vec<usize>>,
    applied: HashMap<ChangeId, usize>,
    heads: BTreeSet<ChangeId>,
    state: MergeMap,
    clock: Clock,
    /// Latest timestamp seen per author.
    vector_clock: HashMap<AuthorId, Timestamp>,
}

impl Entity {
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self::with_clock(id, Clock::new())
    }

    /// Create an entity sharing a pre-seeded clock, used when several
    /// entities are mutated in one session.
    #[must_use]
    pub fn with_clock(id: EntityId, clock: Clock) -> Self {
        Self {
            id,
            cids: Vec::new(),
            changes: Vec::new(),
            deps: Vec::new(),
            rdeps: Vec::new(),
            applied: HashMap::new(),
            heads: BTreeSet::new(),
            state: MergeMap::new(),
            clock,
            vector_clock: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The merged register state.
    #[must_use]
    pub fn state(&self) -> &MergeMap {
        &self.state
    }

    /// The winning value at a path.
    #[must_use]
    pub fn get(&self, path: &[String]) -> Option<&Value> {
        self.state.get(path)
    }

    /// Current head change IDs, sorted.
    #[must_use]
    pub fn heads(&self) -> &BTreeSet<ChangeId> {
        &self.heads
    }

    /// The maximum timestamp applied so far.
    #[must_use]
    pub fn last_change_time(&self) -> Timestamp {
        self.clock.max()
    }

    /// All applied changes in application order.
    pub fn changes(&self) -> impl Iterator<Item = (&ChangeId, &Change)> {
        self.cids.iter().zip(self.changes.iter())
    }

    /// Everyone who has authored a change on this entity, sorted.
    #[must_use]
    pub fn authors(&self) -> Vec<AuthorId> {
        let mut out: Vec<AuthorId> = self.vector_clock.keys().cloned().collect();
        out.sort();
        out
    }

    /// The version string: sorted head IDs joined with `.`. Empty for an
    /// entity with no changes.
    #[must_use]
    pub fn version(&self) -> String {
        let ids: Vec<&str> = self.heads.iter().map(ChangeId::as_str).collect();
        ids.join(".")
    }

    /// Apply one change.
    ///
    /// Re-applying an identical change is absorbed as a no-op. All
    /// checks run before any state is touched.
    ///
    /// # Errors
    ///
    /// [`CrdtError::DuplicateChange`] if the ID was applied with
    /// different content, [`CrdtError::EntityMismatch`] for a change
    /// targeting another entity, [`CrdtError::SignatureInvalid`],
    /// [`CrdtError::CausalityViolation`],
    /// [`CrdtError::MissingDependency`], or
    /// [`CrdtError::InvalidPatchShape`].
    pub fn apply_change(&mut self, id: ChangeId, ch: Change) -> Result<()> {
        if let Some(&idx) = self.applied.get(&id) {
            if self.changes[idx] == ch {
                debug!(change = %id, "absorbing duplicate change");
                return Ok(());
            }
            return Err(CrdtError::DuplicateChange { change: id });
        }

        if ch.entity != self.id {
            return Err(CrdtError::EntityMismatch {
                want: self.id.clone(),
                got: ch.entity,
            });
        }

        ch.verify()?;

        if let Some(&last) = self.vector_clock.get(&ch.author)
            && ch.ts < last
        {
            return Err(CrdtError::CausalityViolation {
                change: id,
                detail: format!("timestamp {} is behind the author's last timestamp {last}", ch.ts),
            });
        }
        if ch.ts < self.clock.max() {
            return Err(CrdtError::CausalityViolation {
                change: id,
                detail: format!(
                    "timestamp {} is behind the entity's maximum {}",
                    ch.ts,
                    self.clock.max()
                ),
            });
        }

        let mut dep_idx = Vec::with_capacity(ch.deps.len());
        for dep in &ch.deps {
            let &i = self.applied.get(dep).ok_or_else(|| CrdtError::MissingDependency {
                change: id.clone(),
                dep: dep.clone(),
            })?;
            dep_idx.push(i);
        }

        // First mutation; MergeMap::apply_patch is itself atomic, so a
        // malformed payload still leaves the entity unchanged.
        self.state.apply_patch(ch.ts, &id.origin(), &ch.payload)?;

        self.clock.track(ch.ts);
        self.vector_clock.insert(ch.author.clone(), ch.ts);

        let cur = self.changes.len();
        for (i, dep) in ch.deps.iter().enumerate() {
            self.heads.remove(dep);
            add_unique(&mut self.rdeps[dep_idx[i]], cur);
        }
        let mut cur_deps = Vec::new();
        for &d in &dep_idx {
            add_unique(&mut cur_deps, d);
        }
        self.cids.push(id.clone());
        self.deps.push(cur_deps);
        self.rdeps.push(Vec::new());
        self.changes.push(ch);
        self.heads.insert(id.clone());
        self.applied.insert(id, cur);
        Ok(())
    }

    /// Build, sign, and self-apply a new change on top of the current
    /// heads.
    ///
    /// # Errors
    ///
    /// [`CrdtError::ClockSkewExceeded`] from the clock, or any
    /// [`Entity::apply_change`] failure.
    pub fn create_change(
        &mut self,
        action: impl Into<String>,
        payload: Value,
        signer: &dyn Signer,
    ) -> Result<(ChangeId, Change)> {
        let ts = self.clock.now()?;
        let deps: Vec<ChangeId> = self.heads.iter().cloned().collect();
        let ch = Change::new(self.id.clone(), deps, action, payload, ts, signer);
        let id = ch.content_id();
        self.apply_change(id.clone(), ch.clone())?;
        Ok((id, ch))
    }

    /// The minimal dependency set for the current heads.
    ///
    /// Direct head deps can be redundant when they are reachable from
    /// each other. Given `a ← b ← c ← d` and `e` depending on `b`, with
    /// heads `{d, e}`, only `c` is returned: `b` is already implied.
    #[must_use]
    pub fn deps(&self) -> Vec<ChangeId> {
        if self.heads.is_empty() {
            return Vec::new();
        }

        // With a single head its deps are minimal by construction.
        if self.heads.len() == 1 {
            let head = self
                .heads
                .iter()
                .next()
                .and_then(|h| self.applied.get(h));
            let Some(&idx) = head else {
                return Vec::new();
            };
            let mut out = self.changes[idx].deps.clone();
            out.sort();
            return out;
        }

        let mut full: HashSet<usize> = HashSet::new();
        for head in &self.heads {
            if let Some(&ihead) = self.applied.get(head) {
                full.extend(self.deps[ihead].iter().copied());
            }
        }
        let mut reduced = full.clone();

        // A dep is redundant when walking its reverse edges reaches
        // another collected dep.
        let mut stack: Vec<usize> = full.iter().copied().collect();
        let mut visited: HashSet<usize> = HashSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            for &rdep in &self.rdeps[node] {
                if !visited.contains(&rdep) {
                    stack.push(rdep);
                }
                if full.contains(&rdep) {
                    reduced.remove(&node);
                    break;
                }
            }
        }

        let mut out: Vec<ChangeId> = reduced.iter().map(|&i| self.cids[i].clone()).collect();
        out.sort();
        out
    }
}

/// Insert into a small sorted vec, keeping it sorted and deduplicated.
fn add_unique(v: &mut Vec<usize>, x: usize) {
    if let Err(pos) = v.binary_search(&x) {
        v.insert(pos, x);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
