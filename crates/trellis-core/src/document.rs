//! Mutable document session over an entity.
//!
//! A [`Document`] stages one batch of edits — metadata writes, block
//! content replacements, and structural moves — and turns the batch into
//! a single signed change. Block content lives in the entity's merge map
//! under `blocks/<id>/#map`; structure lives in compact move records
//! appended to the `moves` list and replayed into a [`TreeCrdt`].
//!
//! The session is one-shot: after [`Document::change`] the staged state
//! is committed and the document can be hydrated into a [`DocumentView`];
//! further edits need a fresh session over the same entity.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::change::{Change, ChangeId};
use crate::clock::Timestamp;
use crate::entity::Entity;
use crate::error::{CrdtError, Result};
use crate::signer::Signer;
use crate::tree::{MoveEffect, OpId, TRASH, TreeCrdt, TreeMutation};

/// Merge-map key holding the move list.
const MOVES_KEY: &str = "moves";
/// Merge-map key holding block content registers.
const BLOCKS_KEY: &str = "blocks";
/// Merge-map key holding document metadata.
const METADATA_KEY: &str = "metadata";
/// Placeholder field for a change with no content.
const DRAFT_KEY: &str = "isDraft";

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// Content of one block. The ID and revision are positional and never
/// serialized into the content register.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    #[serde(skip)]
    pub id: String,
    /// Change ID that last wrote this block's content.
    #[serde(skip)]
    pub revision: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl Block {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: String::new(),
            kind: kind.into(),
            text: text.into(),
            attributes: Map::new(),
        }
    }

    /// The content register representation (no ID, no revision).
    fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| CrdtError::Internal(e.to_string()))
    }

    fn from_value(id: &str, revision: String, value: Value) -> Result<Self> {
        let mut block: Self = serde_json::from_value(value)
            .map_err(|e| CrdtError::InvalidPatchShape(format!("malformed block register: {e}")))?;
        block.id = id.to_owned();
        block.revision = revision;
        Ok(block)
    }
}

/// A block with its visible children, in sibling order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockNode {
    pub block: Block,
    pub children: Vec<BlockNode>,
}

/// A fully materialized read-only document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub owner: String,
    pub authors: Vec<String>,
    pub version: String,
    pub previous_version: String,
    pub content: Vec<BlockNode>,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// One editing session over an entity.
pub struct Document {
    entity: Entity,
    signer: Box<dyn Signer>,
    tree: TreeCrdt,
    staged: Option<TreeMutation>,
    patch: Map<String, Value>,
    /// Abbreviated origins back to full change IDs, for block revisions.
    origins: HashMap<String, ChangeId>,
    created_blocks: HashSet<String>,
    deleted_blocks: HashSet<String>,
    done: bool,
}

impl Document {
    /// Open a session, replaying the entity's move list into a tree.
    ///
    /// # Errors
    ///
    /// [`CrdtError::InvalidPatchShape`] for malformed move records, or
    /// any [`TreeCrdt::integrate`] failure.
    pub fn new(entity: Entity, signer: Box<dyn Signer>) -> Result<Self> {
        let mut tree = TreeCrdt::new();
        let mut origins = HashMap::new();
        for (cid, _) in entity.changes() {
            origins.insert(cid.origin(), cid.clone());
        }

        let mut failed: Option<CrdtError> = None;
        entity
            .state()
            .for_each_list_chunk(&[MOVES_KEY.to_owned()], |ts, origin, items| {
                for (i, item) in items.iter().enumerate() {
                    if let Err(e) = replay_move(&mut tree, ts, origin, i, item) {
                        failed = Some(e);
                        return false;
                    }
                }
                true
            });
        if let Some(e) = failed {
            return Err(e);
        }

        Ok(Self {
            entity,
            signer,
            tree,
            staged: None,
            patch: Map::new(),
            origins,
            created_blocks: HashSet::new(),
            deleted_blocks: HashSet::new(),
            done: false,
        })
    }

    #[must_use]
    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Give the entity back, ending the session.
    #[must_use]
    pub fn into_entity(self) -> Entity {
        self.entity
    }

    /// Stage a metadata write. Writing the current value is a no-op.
    pub fn set_metadata(&mut self, key: &str, value: &str) {
        let path = [METADATA_KEY.to_owned(), key.to_owned()];
        if self.entity.get(&path).and_then(Value::as_str) == Some(value) {
            return;
        }
        object_set(
            &mut self.patch,
            &[METADATA_KEY, key],
            Value::String(value.to_owned()),
        );
    }

    /// Stage a block content replacement. Replacing with identical
    /// content is a no-op.
    ///
    /// # Errors
    ///
    /// [`CrdtError::InvalidPatchShape`] for a block without an ID.
    pub fn replace_block(&mut self, block: &Block) -> Result<()> {
        if block.id.is_empty() {
            return Err(CrdtError::InvalidPatchShape(
                "block must have an ID".into(),
            ));
        }
        let value = block.to_value()?;
        let path = [BLOCKS_KEY.to_owned(), block.id.clone(), "#map".to_owned()];
        if self.entity.get(&path) == Some(&value) {
            return Ok(());
        }
        object_set(&mut self.patch, &[BLOCKS_KEY, &block.id, "#map"], value);
        Ok(())
    }

    /// Stage a structural move. An empty `parent` is the document root;
    /// an empty `left` is the first position.
    ///
    /// # Errors
    ///
    /// [`CrdtError::InvalidMove`] or [`CrdtError::CycleDetected`] from
    /// the tree; deleting must go through [`Document::delete_block`].
    pub fn move_block(&mut self, block: &str, parent: &str, left: &str) -> Result<()> {
        if parent == TRASH {
            return Err(CrdtError::InvalidMove(
                "use delete_block to delete a block".into(),
            ));
        }
        match self.ensure_mutation().move_block(block, parent, left)? {
            MoveEffect::Created => {
                self.created_blocks.insert(block.to_owned());
            }
            MoveEffect::Moved => {
                // The block may have been moved out of trash.
                self.deleted_blocks.remove(block);
            }
            MoveEffect::None => {}
        }
        Ok(())
    }

    /// Stage a block deletion (a move to [`TRASH`]).
    ///
    /// # Errors
    ///
    /// Propagates tree move failures.
    pub fn delete_block(&mut self, block: &str) -> Result<()> {
        if self.ensure_mutation().move_block(block, TRASH, "")? == MoveEffect::Moved {
            self.deleted_blocks.insert(block.to_owned());
        }
        Ok(())
    }

    /// Fold the staged edits into one signed change, apply it to the
    /// entity, and commit the staged moves into the tree.
    ///
    /// # Errors
    ///
    /// [`CrdtError::Internal`] when called twice on one session;
    /// otherwise propagates clock, signing, and integration failures.
    pub fn change(&mut self) -> Result<(ChangeId, Change)> {
        if self.done {
            return Err(CrdtError::Internal(
                "document change was already committed".into(),
            ));
        }
        self.cleanup_patch();

        if self.patch.is_empty() {
            self.patch.insert(DRAFT_KEY.to_owned(), Value::Bool(true));
        }

        let payload = Value::Object(std::mem::take(&mut self.patch));
        let (id, ch) = self
            .entity
            .create_change("Update", payload, self.signer.as_ref())?;

        if let Some(mu) = self.staged.take() {
            mu.commit(&id.origin(), ch.ts, &mut self.tree)?;
        }
        self.origins.insert(id.origin(), id.clone());
        self.done = true;
        Ok((id, ch))
    }

    /// Materialize the committed document.
    ///
    /// # Errors
    ///
    /// [`CrdtError::Internal`] on an empty entity, on uncommitted staged
    /// moves, or when the walk reaches a block before its parent.
    pub fn hydrate(&self) -> Result<DocumentView> {
        let Some((_, first)) = self.entity.changes().next() else {
            return Err(CrdtError::Internal("entity has no changes".into()));
        };
        if self.staged.is_some() {
            return Err(CrdtError::Internal(
                "cannot hydrate with uncommitted staged moves".into(),
            ));
        }

        let mut metadata = BTreeMap::new();
        for key in self.entity.state().keys(&[METADATA_KEY.to_owned()]) {
            let path = [METADATA_KEY.to_owned(), key.clone()];
            if let Some(v) = self.entity.get(&path).and_then(Value::as_str) {
                metadata.insert(key, v.to_owned());
            }
        }

        let mut order: Vec<(String, String)> = Vec::new();
        self.tree.mutate().walk(|block, parent| {
            order.push((block.to_owned(), parent.to_owned()));
            true
        });

        let mut nodes: HashMap<String, BlockNode> = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut roots: Vec<String> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();
        for (block, parent) in order {
            let path = [BLOCKS_KEY.to_owned(), block.clone(), "#map".to_owned()];
            let Some((_, origin, value)) = self.entity.state().get_with_origin(&path) else {
                // Moves without content can happen mid-sync; hide the
                // block and its subtree instead of failing.
                skipped.insert(block);
                continue;
            };
            if !parent.is_empty() && skipped.contains(&parent) {
                skipped.insert(block);
                continue;
            }
            if !parent.is_empty() && !nodes.contains_key(&parent) {
                return Err(CrdtError::Internal(format!(
                    "block {block} walked before its parent {parent}"
                )));
            }
            let revision = self
                .origins
                .get(origin)
                .map_or_else(String::new, |c| c.as_str().to_owned());
            let node = BlockNode {
                block: Block::from_value(&block, revision, value.clone())?,
                children: Vec::new(),
            };
            nodes.insert(block.clone(), node);
            if parent.is_empty() {
                roots.push(block);
            } else {
                children.entry(parent).or_default().push(block);
            }
        }

        let mut content = Vec::new();
        for root in roots {
            if let Some(node) = assemble(&root, &mut nodes, &mut children) {
                content.push(node);
            }
        }

        Ok(DocumentView {
            id: self.entity.id().as_str().to_owned(),
            metadata,
            create_time: first.ts.time(),
            update_time: self.entity.last_change_time().time(),
            owner: first.author.to_string(),
            authors: self
                .entity
                .authors()
                .iter()
                .map(ToString::to_string)
                .collect(),
            version: self.entity.version(),
            previous_version: self.entity.deps().iter().map(ChangeId::as_str).collect::<Vec<_>>().join("."),
            content,
        })
    }

    fn ensure_mutation(&mut self) -> &mut TreeMutation {
        let tree = &self.tree;
        self.staged.get_or_insert_with(|| tree.mutate())
    }

    /// Fold staged moves into compact `{"b","p","l"}` records and strip
    /// state of blocks that never survived the batch.
    fn cleanup_patch(&mut self) {
        let mut moves: Vec<Value> = Vec::new();
        if let Some(mu) = &self.staged {
            mu.for_each_move(|block, parent, left, left_origin| {
                let l = if left.is_empty() {
                    String::new()
                } else {
                    format!("{left}@{left_origin}")
                };
                moves.push(json!({"b": block, "p": parent, "l": l}));
                true
            });
        }
        if !moves.is_empty() {
            self.patch.insert(
                MOVES_KEY.to_owned(),
                json!({"#list": {"#ins": moves}}),
            );
        }

        for block in &self.deleted_blocks {
            if self.created_blocks.contains(block) {
                object_delete(&mut self.patch, &[BLOCKS_KEY, block]);
            }
        }
        let blocks_empty =
            matches!(self.patch.get(BLOCKS_KEY), Some(Value::Object(m)) if m.is_empty());
        if blocks_empty {
            self.patch.remove(BLOCKS_KEY);
        }
    }
}

/// Integrate one replayed move record.
fn replay_move(
    tree: &mut TreeCrdt,
    ts: Timestamp,
    origin: &str,
    idx: usize,
    item: &Value,
) -> Result<()> {
    let obj = item
        .as_object()
        .ok_or_else(|| CrdtError::InvalidPatchShape("move record must be an object".into()))?;
    let field = |key: &str| {
        obj.get(key).and_then(Value::as_str).ok_or_else(|| {
            CrdtError::InvalidPatchShape(format!("move record is missing field {key:?}"))
        })
    };
    let block = field("b")?;
    let parent = field("p")?;
    let l = obj.get("l").and_then(Value::as_str).unwrap_or_default();
    let (left, left_origin) = l.split_once('@').unwrap_or((l, ""));
    // A move whose left sibling came from the same change carries a bare
    // `left@`; it inherits the chunk's origin.
    let lo = if !left.is_empty() && left_origin.is_empty() {
        origin
    } else {
        left_origin
    };
    let idx = u32::try_from(idx).map_err(|_| CrdtError::Internal("move index overflow".into()))?;
    tree.integrate(OpId::new(ts, origin, idx), block, parent, left, lo)
}

fn assemble(
    block: &str,
    nodes: &mut HashMap<String, BlockNode>,
    children: &mut HashMap<String, Vec<String>>,
) -> Option<BlockNode> {
    let mut node = nodes.remove(block)?;
    for child in children.remove(block).unwrap_or_default() {
        if let Some(child_node) = assemble(&child, nodes, children) {
            node.children.push(child_node);
        }
    }
    Some(node)
}

/// Set a value at a nested path, creating intermediate objects.
fn object_set(map: &mut Map<String, Value>, path: &[&str], value: Value) {
    let [head, rest @ ..] = path else { return };
    if rest.is_empty() {
        map.insert((*head).to_owned(), value);
        return;
    }
    let entry = map
        .entry((*head).to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(inner) = entry {
        object_set(inner, rest, value);
    }
}

/// Delete the value at a nested path, if present.
fn object_delete(map: &mut Map<String, Value>, path: &[&str]) {
    let [head, rest @ ..] = path else { return };
    if rest.is_empty() {
        map.remove(*head);
        return;
    }
    if let Some(Value::Object(inner)) = map.get_mut(*head) {
        object_delete(inner, rest);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::EntityId;
    use crate::signer::Keypair;

    fn open(entity: Entity, seed: u8) -> Document {
        Document::new(entity, Box::new(Keypair::from_seed([seed; 32]))).expect("open")
    }

    fn fresh(seed: u8) -> Document {
        open(Entity::new(EntityId::new("hm://doc/session")), seed)
    }

    #[test]
    fn edit_commit_hydrate() {
        let mut doc = fresh(1);
        doc.set_metadata("title", "Hello");
        doc.replace_block(&Block::new("b1", "paragraph", "first"))
            .expect("replace");
        doc.replace_block(&Block::new("b2", "paragraph", "second"))
            .expect("replace");
        doc.move_block("b1", "", "").expect("move");
        doc.move_block("b2", "", "b1").expect("move");
        let (id, ch) = doc.change().expect("change");
        assert_eq!(ch.content_id(), id);

        let view = doc.hydrate().expect("hydrate");
        assert_eq!(view.metadata.get("title").map(String::as_str), Some("Hello"));
        assert_eq!(view.version, id.as_str());
        assert_eq!(view.content.len(), 2);
        assert_eq!(view.content[0].block.id, "b1");
        assert_eq!(view.content[0].block.text, "first");
        assert_eq!(view.content[1].block.id, "b2");
        assert_eq!(view.content[0].block.revision, id.as_str());
    }

    #[test]
    fn nested_blocks_hydrate_as_children() {
        let mut doc = fresh(1);
        doc.replace_block(&Block::new("b1", "heading", "top"))
            .expect("replace");
        doc.replace_block(&Block::new("c1", "paragraph", "inner"))
            .expect("replace");
        doc.move_block("b1", "", "").expect("move");
        doc.move_block("c1", "b1", "").expect("move");
        doc.change().expect("change");

        let view = doc.hydrate().expect("hydrate");
        assert_eq!(view.content.len(), 1);
        assert_eq!(view.content[0].children.len(), 1);
        assert_eq!(view.content[0].children[0].block.id, "c1");
    }

    #[test]
    fn empty_change_is_a_draft_placeholder() {
        let mut doc = fresh(1);
        let (_, ch) = doc.change().expect("change");
        assert_eq!(ch.payload, json!({"isDraft": true}));
    }

    #[test]
    fn non_empty_change_carries_no_draft_marker() {
        let mut doc = fresh(1);
        doc.set_metadata("title", "t");
        let (_, ch) = doc.change().expect("change");
        assert!(ch.payload.get("isDraft").is_none());
        assert_eq!(ch.payload, json!({"metadata": {"title": "t"}}));
    }

    #[test]
    fn moves_are_recorded_as_compact_list() {
        let mut doc = fresh(1);
        doc.replace_block(&Block::new("b1", "paragraph", "x"))
            .expect("replace");
        doc.move_block("b1", "", "").expect("move");
        let (_, ch) = doc.change().expect("change");
        assert_eq!(
            ch.payload["moves"],
            json!({"#list": {"#ins": [{"b": "b1", "p": "", "l": ""}]}})
        );
    }

    #[test]
    fn replay_restores_the_tree() {
        let mut doc = fresh(1);
        doc.replace_block(&Block::new("b1", "paragraph", "one"))
            .expect("replace");
        doc.replace_block(&Block::new("b2", "paragraph", "two"))
            .expect("replace");
        doc.move_block("b1", "", "").expect("move");
        doc.move_block("b2", "", "b1").expect("move");
        doc.change().expect("change");
        let before = doc.hydrate().expect("hydrate");

        let reopened = open(doc.into_entity(), 1);
        let after = reopened.hydrate().expect("hydrate");
        assert_eq!(before.content, after.content);
        assert_eq!(before.version, after.version);
    }

    #[test]
    fn sessions_compose_across_changes() {
        let mut doc = fresh(1);
        doc.replace_block(&Block::new("b1", "paragraph", "one"))
            .expect("replace");
        doc.move_block("b1", "", "").expect("move");
        doc.change().expect("change");

        let mut doc = open(doc.into_entity(), 1);
        doc.replace_block(&Block::new("b2", "paragraph", "two"))
            .expect("replace");
        doc.move_block("b2", "", "").expect("move");
        doc.delete_block("b1").expect("delete");
        let (id2, _) = doc.change().expect("change");

        let view = doc.hydrate().expect("hydrate");
        assert_eq!(view.content.len(), 1);
        assert_eq!(view.content[0].block.id, "b2");
        assert_eq!(view.version, id2.as_str());
        assert!(!view.previous_version.is_empty());
    }

    #[test]
    fn create_and_delete_in_one_batch_leaves_no_trace() {
        let mut doc = fresh(1);
        doc.replace_block(&Block::new("b1", "paragraph", "ghost"))
            .expect("replace");
        doc.move_block("b1", "", "").expect("move");
        doc.delete_block("b1").expect("delete");
        let (_, ch) = doc.change().expect("change");
        assert_eq!(ch.payload, json!({"isDraft": true}));
    }

    #[test]
    fn replacing_with_identical_content_is_elided() {
        let mut doc = fresh(1);
        let b = Block::new("b1", "paragraph", "same");
        doc.replace_block(&b).expect("replace");
        doc.move_block("b1", "", "").expect("move");
        doc.change().expect("change");

        let mut doc = open(doc.into_entity(), 1);
        doc.replace_block(&b).expect("replace");
        doc.set_metadata("title", "t");
        let (_, ch) = doc.change().expect("change");
        assert!(ch.payload.get("blocks").is_none(), "no redundant block write");
    }

    #[test]
    fn change_is_one_shot() {
        let mut doc = fresh(1);
        doc.change().expect("first");
        assert!(doc.change().is_err());
    }

    #[test]
    fn deleting_via_move_block_is_rejected() {
        let mut doc = fresh(1);
        assert!(doc.move_block("b1", TRASH, "").is_err());
    }

    #[test]
    fn hydrate_rejects_staged_state() {
        let mut doc = fresh(1);
        doc.replace_block(&Block::new("b1", "paragraph", "x"))
            .expect("replace");
        doc.move_block("b1", "", "").expect("move");
        assert!(doc.hydrate().is_err());
    }

    #[test]
    fn block_without_content_register_is_hidden() {
        let mut doc = fresh(1);
        // A structural move without a matching content write.
        doc.move_block("b1", "", "").expect("move");
        doc.set_metadata("title", "t");
        doc.change().expect("change");
        let view = doc.hydrate().expect("hydrate");
        assert!(view.content.is_empty());
    }
}
