//! Move-based ordered tree CRDT.
//!
//! Every structural edit is a *move*: place `block` under `parent` after
//! sibling `left`. Moves are totally ordered by [`OpId`] and integrated
//! into an append-only log; the visible tree is derived from the log, so
//! replicas that integrate the same moves in any order see the same tree.
//!
//! Sibling order is materialized with fractional-index keys (see
//! [`fracdex`]): concurrent inserts at the same position are untangled
//! with the RGA rule — an incoming move skips over right siblings whose
//! op is greater than its own and lands before the first smaller one.
//!
//! Deletion is a move to the [`TRASH`] node. A cycle-inducing move is
//! rejected locally, and silently hidden when it arrives from a replica
//! that couldn't know better.
//!
//! Local edits never touch the log directly. They are staged in a
//! [`TreeMutation`] — a copy-on-write view that also folds redundant
//! moves (move to current position, create-then-delete) — and reach the
//! log only through [`TreeMutation::commit`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Included, Unbounded};

use crate::clock::Timestamp;
use crate::error::{CrdtError, Result};

pub mod fracdex;

/// Virtual parent of deleted blocks. Never shown, never a real block ID.
pub const TRASH: &str = "◊";

// ---------------------------------------------------------------------------
// OpId
// ---------------------------------------------------------------------------

/// Identity and total order of a move operation.
///
/// Moves from one commit share `(ts, origin)` and are distinguished by
/// their index inside the commit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
    pub ts: Timestamp,
    pub origin: String,
    pub idx: u32,
}

impl OpId {
    #[must_use]
    pub fn new(ts: Timestamp, origin: impl Into<String>, idx: u32) -> Self {
        Self {
            ts,
            origin: origin.into(),
            idx,
        }
    }
}

/// What a staged move actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveEffect {
    /// Nothing changed (e.g. deleting an already-deleted block).
    None,
    /// The block entered the tree.
    Created,
    /// The block changed position.
    Moved,
}

/// One move record. `op` is `None` while the move is only staged locally.
#[derive(Debug, Clone)]
struct Move {
    op: Option<OpId>,
    block: String,
    parent: String,
    left: String,
    left_origin: String,
    fracdex: String,
}

// ---------------------------------------------------------------------------
// TreeCrdt
// ---------------------------------------------------------------------------

/// Integrated move state shared by all replicas.
#[derive(Debug, Clone, Default)]
pub struct TreeCrdt {
    /// Arena of all integrated moves, indexed by the maps below.
    moves: Vec<Move>,
    /// Integration log ordered by [`OpId`].
    log: BTreeMap<OpId, usize>,
    /// Sibling order: `(parent, fracdex)` to move index.
    tree: BTreeMap<(String, String), usize>,
    /// One move per `(block, origin)` pair.
    origins: HashMap<(String, String), usize>,
}

impl TreeCrdt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate one move from the log.
    ///
    /// Re-integrating a move identical to an already-integrated one is a
    /// no-op; a *different* move for the same `(block, origin)` pair is a
    /// [`CrdtError::DuplicateMove`].
    ///
    /// # Errors
    ///
    /// [`CrdtError::DuplicateMove`] or [`CrdtError::InvalidMove`] as
    /// described above; [`CrdtError::Fracdex`] if no order key fits.
    pub fn integrate(
        &mut self,
        op: OpId,
        block: &str,
        parent: &str,
        left: &str,
        left_origin: &str,
    ) -> Result<()> {
        let origin_key = (block.to_owned(), op.origin.clone());
        if let Some(&existing) = self.origins.get(&origin_key) {
            let m = &self.moves[existing];
            if m.op.as_ref() == Some(&op)
                && m.parent == parent
                && m.left == left
                && m.left_origin == left_origin
            {
                return Ok(());
            }
            return Err(CrdtError::DuplicateMove {
                block: block.to_owned(),
                origin: op.origin,
            });
        }

        if left == TRASH {
            return Err(CrdtError::InvalidMove(
                "left must not be the trash node".into(),
            ));
        }
        if !left.is_empty() && left_origin.is_empty() {
            return Err(CrdtError::InvalidMove(
                "left origin must be set when left is set".into(),
            ));
        }

        let (li, ri) = self.find_insertion_point(&op, parent, left, left_origin)?;
        let fracdex = fracdex::key_between(&li, &ri)?;

        let idx = self.moves.len();
        self.moves.push(Move {
            op: Some(op.clone()),
            block: block.to_owned(),
            parent: parent.to_owned(),
            left: left.to_owned(),
            left_origin: left_origin.to_owned(),
            fracdex: fracdex.clone(),
        });
        self.log.insert(op, idx);
        self.tree.insert((parent.to_owned(), fracdex), idx);
        self.origins.insert(origin_key, idx);
        Ok(())
    }

    /// Start a copy-on-write mutation over the current state.
    #[must_use]
    pub fn mutate(&self) -> TreeMutation {
        let mut mu = TreeMutation {
            moves: self.moves.clone(),
            tree: self.tree.clone(),
            parents: HashMap::new(),
            original_winners: BTreeMap::new(),
            dirty_winners: BTreeMap::new(),
            original_invisible: HashSet::new(),
            dirty_invisible: HashSet::new(),
        };

        // Replay the log: the latest non-cycle-inducing move per block
        // wins; everything it supersedes becomes invisible.
        for &idx in self.log.values() {
            let (block, parent) = {
                let m = &mu.moves[idx];
                (m.block.clone(), m.parent.clone())
            };
            if mu.is_ancestor(&block, &parent) {
                mu.original_invisible.insert(idx);
                continue;
            }
            if let Some(&prev) = mu.original_winners.get(&block) {
                mu.original_invisible.insert(prev);
            }
            mu.original_winners.insert(block.clone(), idx);
            mu.parents.insert(block, parent);
        }

        mu.dirty_winners = mu.original_winners.clone();
        mu.dirty_invisible = mu.original_invisible.clone();
        mu
    }

    /// The sibling position a new op lands at, honoring the RGA rule:
    /// skip right siblings with a greater op, stop before a smaller one.
    fn find_insertion_point(
        &self,
        op: &OpId,
        parent: &str,
        left: &str,
        left_origin: &str,
    ) -> Result<(String, String)> {
        let mut left_fd = String::new();
        if !left.is_empty() {
            let &lidx = self
                .origins
                .get(&(left.to_owned(), left_origin.to_owned()))
                .ok_or_else(|| {
                    CrdtError::InvalidMove(format!(
                        "left sibling {left}@{left_origin} not found under parent {parent}"
                    ))
                })?;
            let lm = &self.moves[lidx];
            if lm.parent != parent {
                return Err(CrdtError::InvalidMove(format!(
                    "left sibling {left}@{left_origin} is not a child of parent {parent}"
                )));
            }
            left_fd = lm.fracdex.clone();
        }

        let mut right = String::new();
        let start = (parent.to_owned(), left_fd.clone());
        for ((p, fd), &i) in self.tree.range((Excluded(start), Unbounded)) {
            if p != parent {
                break;
            }
            let existing = self.moves[i].op.as_ref().ok_or_else(|| {
                CrdtError::Internal("staged move found in integrated tree".into())
            })?;
            if existing < op {
                right = fd.clone();
                break;
            }
            left_fd = fd.clone();
        }
        Ok((left_fd, right))
    }
}

// ---------------------------------------------------------------------------
// TreeMutation
// ---------------------------------------------------------------------------

/// A batch of staged local moves over a snapshot of the integrated tree.
///
/// `original_*` views describe the tree as it was when the mutation
/// started; `dirty_*` views include the staged moves. Keeping both lets
/// the mutation recognize and elide moves that change nothing.
#[derive(Debug)]
pub struct TreeMutation {
    moves: Vec<Move>,
    tree: BTreeMap<(String, String), usize>,
    parents: HashMap<String, String>,
    original_winners: BTreeMap<String, usize>,
    dirty_winners: BTreeMap<String, usize>,
    original_invisible: HashSet<usize>,
    dirty_invisible: HashSet<usize>,
}

impl TreeMutation {
    /// Stage a move of `block` under `parent`, after sibling `left`
    /// (empty `left` means first position; [`TRASH`] parent deletes).
    ///
    /// # Errors
    ///
    /// [`CrdtError::InvalidMove`] for structurally impossible arguments,
    /// [`CrdtError::CycleDetected`] if the move would make `block` its
    /// own ancestor.
    pub fn move_block(&mut self, block: &str, parent: &str, left: &str) -> Result<MoveEffect> {
        if block.is_empty() {
            return Err(CrdtError::InvalidMove("block must not be empty".into()));
        }
        if block == left {
            return Err(CrdtError::InvalidMove(
                "block and left must not be the same".into(),
            ));
        }
        if left == TRASH {
            return Err(CrdtError::InvalidMove(
                "left must not be the trash node".into(),
            ));
        }
        if !parent.is_empty() && parent == left {
            return Err(CrdtError::InvalidMove(
                "parent and left must not be the same".into(),
            ));
        }
        if !parent.is_empty() && parent != TRASH && !self.parents.contains_key(parent) {
            return Err(CrdtError::InvalidMove(format!(
                "parent block {parent} is not in the tree"
            )));
        }
        if self.is_ancestor(block, parent) {
            return Err(CrdtError::CycleDetected {
                block: block.to_owned(),
                parent: parent.to_owned(),
            });
        }

        let left_fracdex = if left.is_empty() {
            String::new()
        } else {
            let &lidx = self.dirty_winners.get(left).ok_or_else(|| {
                CrdtError::InvalidMove(format!("left block {left} is not in the tree"))
            })?;
            let lm = &self.moves[lidx];
            if lm.parent != parent {
                return Err(CrdtError::InvalidMove(format!(
                    "left block {left} is not a child of parent {parent}"
                )));
            }
            lm.fracdex.clone()
        };

        let mut effect = MoveEffect::Created;
        if let Some(&prev) = self.dirty_winners.get(block) {
            let (prev_parent, prev_staged, prev_key) = {
                let pm = &self.moves[prev];
                (
                    pm.parent.clone(),
                    pm.op.is_none(),
                    (pm.parent.clone(), pm.fracdex.clone()),
                )
            };
            // Deleting an already-deleted block changes nothing.
            if prev_parent == TRASH && parent == TRASH {
                return Ok(MoveEffect::None);
            }
            if prev_staged {
                // Our own staged move can simply be dropped.
                self.tree.remove(&prev_key);
                self.dirty_invisible.remove(&prev);
                self.original_invisible.remove(&prev);
            } else {
                self.dirty_invisible.insert(prev);
            }
            effect = MoveEffect::Moved;
        }

        self.parents
            .insert(block.to_owned(), parent.to_owned());

        let right_fracdex = self.right_fracdex(parent, &left_fracdex);
        let fracdex = fracdex::key_between(&left_fracdex, &right_fracdex)?;

        let m_idx = self.moves.len();
        self.moves.push(Move {
            op: None,
            block: block.to_owned(),
            parent: parent.to_owned(),
            left: String::new(),
            left_origin: String::new(),
            fracdex: fracdex.clone(),
        });
        let m_key = (parent.to_owned(), fracdex);
        self.original_invisible.insert(m_idx);
        self.tree.insert(m_key.clone(), m_idx);
        self.dirty_winners.insert(block.to_owned(), m_idx);

        match self.original_winners.get(block).copied() {
            // Created and deleted within the same mutation: drop the
            // move entirely.
            None if parent == TRASH => {
                self.dirty_invisible.remove(&m_idx);
                self.original_invisible.remove(&m_idx);
                self.dirty_winners.remove(block);
                self.tree.remove(&m_key);
                Ok(MoveEffect::Moved)
            }
            // Same parent as before the mutation: if the visible left
            // sibling didn't change either, the move is redundant.
            // Restore the original winner and drop ours.
            Some(original) if self.moves[original].parent == parent => {
                let current_left = self.visible_left_sibling(&m_key, &self.dirty_invisible);
                let orig_key = {
                    let om = &self.moves[original];
                    (om.parent.clone(), om.fracdex.clone())
                };
                let original_left =
                    self.visible_left_sibling(&orig_key, &self.original_invisible);
                if current_left == original_left {
                    self.dirty_invisible.remove(&m_idx);
                    self.dirty_invisible.remove(&original);
                    self.original_invisible.remove(&m_idx);
                    self.dirty_winners.insert(block.to_owned(), original);
                    self.tree.remove(&m_key);
                    self.tree.insert(orig_key, original);
                    return Ok(MoveEffect::Moved);
                }
                Ok(effect)
            }
            _ => Ok(effect),
        }
    }

    /// Visit staged moves in depth-first tree order, then staged
    /// deletions, yielding `(block, parent, left, left_origin)`. An empty
    /// `left_origin` with a non-empty `left` means the left sibling is
    /// itself staged in this mutation.
    pub fn for_each_move(&self, mut f: impl FnMut(&str, &str, &str, &str) -> bool) {
        self.walk_dft(|idx| {
            let m = &self.moves[idx];
            if m.op.is_some() {
                return true;
            }
            let key = (m.parent.clone(), m.fracdex.clone());
            let (left, left_origin) = self.visible_left_sibling(&key, &self.dirty_invisible);
            f(&m.block, &m.parent, &left, &left_origin)
        });

        let start = (TRASH.to_owned(), String::new());
        for ((p, _), &idx) in self.tree.range((Included(start), Unbounded)) {
            if p != TRASH {
                break;
            }
            let m = &self.moves[idx];
            if m.op.is_some() {
                continue;
            }
            if !f(&m.block, TRASH, "", "") {
                return;
            }
        }
    }

    /// Integrate every staged move into `state` under one `(ts, origin)`
    /// commit, consuming the mutation.
    ///
    /// # Errors
    ///
    /// Propagates the first [`TreeCrdt::integrate`] failure.
    pub fn commit(self, origin: &str, ts: Timestamp, state: &mut TreeCrdt) -> Result<()> {
        let mut idx: u32 = 0;
        let mut failed: Option<CrdtError> = None;
        self.for_each_move(|block, parent, left, left_origin| {
            // A staged left sibling gets our own origin.
            let lo = if !left.is_empty() && left_origin.is_empty() {
                origin
            } else {
                left_origin
            };
            match state.integrate(OpId::new(ts, origin, idx), block, parent, left, lo) {
                Ok(()) => {
                    idx += 1;
                    true
                }
                Err(e) => {
                    failed = Some(e);
                    false
                }
            }
        });
        failed.map_or(Ok(()), Err)
    }

    /// Visit the visible tree (staged moves included) in depth-first
    /// order, yielding `(block, parent)`.
    pub fn walk(&self, mut f: impl FnMut(&str, &str) -> bool) {
        self.walk_dft(|idx| {
            let m = &self.moves[idx];
            f(&m.block, &m.parent)
        });
    }

    /// Whether `a` is an ancestor of `b` in the dirty view.
    #[must_use]
    pub fn is_ancestor(&self, a: &str, b: &str) -> bool {
        let mut c = self.parents.get(b).cloned().unwrap_or_default();
        loop {
            if c.is_empty() || c == TRASH {
                return false;
            }
            if c == a {
                return true;
            }
            c = self.parents.get(&c).cloned().unwrap_or_default();
        }
    }

    fn walk_dft(&self, mut f: impl FnMut(usize) -> bool) {
        let mut stack: Vec<usize> = Vec::new();
        self.push_children("", &mut stack);
        while let Some(idx) = stack.pop() {
            if !f(idx) {
                break;
            }
            let block = self.moves[idx].block.clone();
            self.push_children(&block, &mut stack);
        }
    }

    /// Push visible children of `parent` so they pop in sibling order.
    fn push_children(&self, parent: &str, stack: &mut Vec<usize>) {
        let start = (parent.to_owned(), String::new());
        let mut children: Vec<usize> = Vec::new();
        for ((p, _), &idx) in self.tree.range((Included(start), Unbounded)) {
            if p != parent {
                break;
            }
            if self.dirty_invisible.contains(&idx) {
                continue;
            }
            children.push(idx);
        }
        stack.extend(children.iter().rev());
    }

    /// Nearest visible left sibling of the move at `key`, as
    /// `(block, origin)`. Empty strings when there is none.
    fn visible_left_sibling(
        &self,
        key: &(String, String),
        invisible: &HashSet<usize>,
    ) -> (String, String) {
        let start = (key.0.clone(), String::new());
        for (_, &idx) in self
            .tree
            .range((Included(start), Excluded(key.clone())))
            .rev()
        {
            if invisible.contains(&idx) {
                continue;
            }
            let m = &self.moves[idx];
            let origin = m
                .op
                .as_ref()
                .map_or_else(String::new, |op| op.origin.clone());
            return (m.block.clone(), origin);
        }
        (String::new(), String::new())
    }

    /// Immediate right neighbor's order key, or empty at the end.
    fn right_fracdex(&self, parent: &str, after: &str) -> String {
        let start = (parent.to_owned(), after.to_owned());
        self.tree
            .range((Excluded(start), Unbounded))
            .next()
            .filter(|((p, _), _)| p == parent)
            .map_or_else(String::new, |((_, fd), _)| fd.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_raw(n << 16)
    }

    /// Visible blocks in depth-first order.
    fn layout(state: &TreeCrdt) -> Vec<String> {
        let mut out = Vec::new();
        state.mutate().walk(|block, _| {
            out.push(block.to_owned());
            true
        });
        out
    }

    fn stage_and_commit(
        state: &mut TreeCrdt,
        origin: &str,
        t: Timestamp,
        edits: &[(&str, &str, &str)],
    ) {
        let mut mu = state.mutate();
        for (block, parent, left) in edits {
            mu.move_block(block, parent, left).expect("move");
        }
        mu.commit(origin, t, state).expect("commit");
    }

    // -- basic shape ---------------------------------------------------------

    #[test]
    fn create_blocks_in_order() {
        let mut state = TreeCrdt::new();
        stage_and_commit(
            &mut state,
            "aaaa",
            ts(1),
            &[("b1", "", ""), ("b2", "", "b1"), ("b3", "", "b2")],
        );
        assert_eq!(layout(&state), ["b1", "b2", "b3"]);
    }

    #[test]
    fn nesting_walks_depth_first() {
        let mut state = TreeCrdt::new();
        stage_and_commit(
            &mut state,
            "aaaa",
            ts(1),
            &[
                ("b1", "", ""),
                ("b2", "", "b1"),
                ("c1", "b1", ""),
                ("c2", "b1", "c1"),
            ],
        );
        assert_eq!(layout(&state), ["b1", "c1", "c2", "b2"]);
    }

    #[test]
    fn move_reorders_siblings() {
        let mut state = TreeCrdt::new();
        stage_and_commit(
            &mut state,
            "aaaa",
            ts(1),
            &[("b1", "", ""), ("b2", "", "b1"), ("b3", "", "b2")],
        );
        stage_and_commit(&mut state, "bbbb", ts(2), &[("b3", "", "")]);
        assert_eq!(layout(&state), ["b3", "b1", "b2"]);
    }

    #[test]
    fn delete_hides_block_and_subtree() {
        let mut state = TreeCrdt::new();
        stage_and_commit(
            &mut state,
            "aaaa",
            ts(1),
            &[("b1", "", ""), ("c1", "b1", ""), ("b2", "", "b1")],
        );
        stage_and_commit(&mut state, "bbbb", ts(2), &[("b1", TRASH, "")]);
        assert_eq!(layout(&state), ["b2"]);
    }

    // -- staged-move folding -------------------------------------------------

    #[test]
    fn move_to_current_position_is_elided() {
        let mut state = TreeCrdt::new();
        stage_and_commit(&mut state, "aaaa", ts(1), &[("b1", "", ""), ("b2", "", "b1")]);

        let mut mu = state.mutate();
        assert_eq!(mu.move_block("b2", "", "b1").expect("move"), MoveEffect::Moved);
        let mut staged = 0;
        mu.for_each_move(|_, _, _, _| {
            staged += 1;
            true
        });
        assert_eq!(staged, 0, "no-op move must not produce a move record");
    }

    #[test]
    fn create_then_delete_is_discarded() {
        let state = TreeCrdt::new();
        let mut mu = state.mutate();
        assert_eq!(mu.move_block("b1", "", "").expect("move"), MoveEffect::Created);
        assert_eq!(mu.move_block("b1", TRASH, "").expect("move"), MoveEffect::Moved);
        let mut staged = 0;
        mu.for_each_move(|_, _, _, _| {
            staged += 1;
            true
        });
        assert_eq!(staged, 0);
    }

    #[test]
    fn double_delete_has_no_effect() {
        let mut state = TreeCrdt::new();
        stage_and_commit(&mut state, "aaaa", ts(1), &[("b1", "", "")]);
        stage_and_commit(&mut state, "bbbb", ts(2), &[("b1", TRASH, "")]);
        let mut mu = state.mutate();
        assert_eq!(mu.move_block("b1", TRASH, "").expect("move"), MoveEffect::None);
    }

    #[test]
    fn repeated_staged_moves_collapse_to_one() {
        let mut state = TreeCrdt::new();
        stage_and_commit(
            &mut state,
            "aaaa",
            ts(1),
            &[("b1", "", ""), ("b2", "", "b1"), ("b3", "", "b2")],
        );
        let mut mu = state.mutate();
        mu.move_block("b3", "", "").expect("move");
        mu.move_block("b3", "", "b1").expect("move");
        let mut staged = Vec::new();
        mu.for_each_move(|block, _, left, _| {
            staged.push((block.to_owned(), left.to_owned()));
            true
        });
        assert_eq!(staged, [("b3".to_owned(), "b1".to_owned())]);
    }

    // -- validation ----------------------------------------------------------

    #[test]
    fn rejects_cycles() {
        let mut state = TreeCrdt::new();
        stage_and_commit(&mut state, "aaaa", ts(1), &[("b1", "", ""), ("c1", "b1", "")]);
        let mut mu = state.mutate();
        let err = mu.move_block("b1", "c1", "").expect_err("cycle");
        assert!(matches!(err, CrdtError::CycleDetected { .. }));
        let err = mu.move_block("b1", "b1", "").expect_err("self parent");
        assert!(matches!(err, CrdtError::CycleDetected { .. }));
    }

    #[test]
    fn rejects_structurally_invalid_moves() {
        let state = TreeCrdt::new();
        let mut mu = state.mutate();
        assert!(mu.move_block("", "", "").is_err());
        assert!(mu.move_block("b1", "", "b1").is_err());
        assert!(mu.move_block("b1", "missing", "").is_err());
        assert!(mu.move_block("b1", "", "missing").is_err());
        assert!(mu.move_block("b1", "", TRASH).is_err());
    }

    #[test]
    fn rejects_left_under_different_parent() {
        let mut state = TreeCrdt::new();
        stage_and_commit(
            &mut state,
            "aaaa",
            ts(1),
            &[("b1", "", ""), ("c1", "b1", ""), ("b2", "", "b1")],
        );
        let mut mu = state.mutate();
        assert!(mu.move_block("b2", "", "c1").is_err());
    }

    #[test]
    fn duplicate_integrated_move_is_rejected() {
        let mut state = TreeCrdt::new();
        state
            .integrate(OpId::new(ts(1), "aaaa", 0), "b1", "", "", "")
            .expect("integrate");
        // Byte-identical replay is absorbed.
        state
            .integrate(OpId::new(ts(1), "aaaa", 0), "b1", "", "", "")
            .expect("idempotent replay");
        // A different move for the same (block, origin) is not.
        let err = state
            .integrate(OpId::new(ts(2), "aaaa", 0), "b1", TRASH, "", "")
            .expect_err("conflicting move");
        assert!(matches!(err, CrdtError::DuplicateMove { .. }));
    }

    // -- convergence ---------------------------------------------------------

    #[test]
    fn concurrent_inserts_converge_regardless_of_order() {
        let mut base = TreeCrdt::new();
        stage_and_commit(&mut base, "aaaa", ts(1), &[("b1", "", "")]);

        // Two replicas insert after b1 concurrently.
        let ops = [
            (OpId::new(ts(2), "bbbb", 0), "b2"),
            (OpId::new(ts(2), "cccc", 0), "b3"),
        ];

        let mut forward = base.clone();
        for (op, block) in &ops {
            forward
                .integrate(op.clone(), block, "", "b1", "aaaa")
                .expect("integrate");
        }
        let mut reverse = base.clone();
        for (op, block) in ops.iter().rev() {
            reverse
                .integrate(op.clone(), block, "", "b1", "aaaa")
                .expect("integrate");
        }

        assert_eq!(layout(&forward), layout(&reverse));
        // The greater op wins the position closest to the shared left.
        assert_eq!(layout(&forward), ["b1", "b3", "b2"]);
    }

    #[test]
    fn concurrent_moves_pick_single_winner() {
        let mut base = TreeCrdt::new();
        stage_and_commit(
            &mut base,
            "aaaa",
            ts(1),
            &[("b1", "", ""), ("b2", "", "b1"), ("b3", "", "b2")],
        );

        // Replica b moves b3 first; replica c moves it under b1.
        let ops: [(OpId, &str, &str, &str, &str); 2] = [
            (OpId::new(ts(2), "bbbb", 0), "b3", "", "", ""),
            (OpId::new(ts(3), "cccc", 0), "b3", "b1", "", ""),
        ];

        let mut forward = base.clone();
        let mut reverse = base.clone();
        for (op, block, parent, left, lo) in &ops {
            forward
                .integrate(op.clone(), block, parent, left, lo)
                .expect("integrate");
        }
        for (op, block, parent, left, lo) in ops.iter().rev() {
            reverse
                .integrate(op.clone(), block, parent, left, lo)
                .expect("integrate");
        }

        assert_eq!(layout(&forward), layout(&reverse));
        // The later move wins: b3 lives under b1.
        assert_eq!(layout(&forward), ["b1", "b3", "b2"]);
    }

    #[test]
    fn remote_cycle_inducing_move_is_hidden() {
        // Two replicas concurrently reparent each other's block.
        let mut base = TreeCrdt::new();
        stage_and_commit(&mut base, "aaaa", ts(1), &[("b1", "", ""), ("b2", "", "b1")]);

        let mut state = base.clone();
        state
            .integrate(OpId::new(ts(2), "bbbb", 0), "b2", "b1", "", "")
            .expect("integrate");
        state
            .integrate(OpId::new(ts(3), "cccc", 0), "b1", "b2", "", "")
            .expect("integrate");

        // The later move would create a cycle given the earlier one, so
        // it is invisible; both blocks stay reachable.
        let visible = layout(&state);
        assert!(visible.contains(&"b1".to_owned()));
        assert!(visible.contains(&"b2".to_owned()));
        assert_eq!(visible, ["b1", "b2"]);
    }

    #[test]
    fn commit_assigns_shared_ts_and_origin() {
        let mut state = TreeCrdt::new();
        let mut mu = state.mutate();
        mu.move_block("b1", "", "").expect("move");
        mu.move_block("b2", "", "b1").expect("move");
        mu.commit("aaaa", ts(5), &mut state).expect("commit");

        assert_eq!(layout(&state), ["b1", "b2"]);
        // A fresh replica integrating the same ops converges.
        let mut other = TreeCrdt::new();
        other
            .integrate(OpId::new(ts(5), "aaaa", 0), "b1", "", "", "")
            .expect("integrate");
        other
            .integrate(OpId::new(ts(5), "aaaa", 1), "b2", "", "b1", "aaaa")
            .expect("integrate");
        assert_eq!(layout(&other), layout(&state));
    }
}
