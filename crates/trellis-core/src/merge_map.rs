//! Path-addressed last-writer-wins register store.
//!
//! Every leaf of a patch lands in a register addressed by its key path.
//! A register keeps all writes it has seen, keyed by `(timestamp, origin)`;
//! reads return the greatest key. Because the winner is a pure function of
//! the stored set, applying the same patches in any order converges.
//!
//! Two tags escape the plain nesting rules:
//!
//! - `{"#map": {...}}` writes the whole object into one register, so a
//!   later atomic write shadows every field of an earlier one at once.
//! - `{"#list": [...]}` (or `{"#list": {"#ins": [...]}}`) appends a chunk
//!   to an append-only list; chunks are read back in `(timestamp, origin)`
//!   order and concatenated.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::clock::Timestamp;
use crate::error::{CrdtError, Result};

/// Key of one write inside a register.
type WriteKey = (Timestamp, String);

/// Key path addressing a register, e.g. `["blocks", "b1", "#map"]`.
type Path = Vec<String>;

// ---------------------------------------------------------------------------
// RegisterValue
// ---------------------------------------------------------------------------

/// One stored write.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    /// A plain JSON leaf (scalar or array).
    Scalar(Value),
    /// A whole object written atomically via the `#map` tag. Always
    /// `Value::Object`.
    AtomicObject(Value),
    /// One append-only chunk written via the `#list` tag.
    ListChunk(Vec<Value>),
}

// ---------------------------------------------------------------------------
// MergeMap
// ---------------------------------------------------------------------------

/// Convergent store of LWW registers and append-only lists.
#[derive(Debug, Clone, Default)]
pub struct MergeMap {
    registers: BTreeMap<Path, BTreeMap<WriteKey, RegisterValue>>,
}

impl MergeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one patch object. Either the whole patch lands or none of it:
    /// the shape is validated before any register is touched.
    ///
    /// # Errors
    ///
    /// [`CrdtError::InvalidPatchShape`] when the patch is not an object or
    /// a `#map`/`#list` tag is malformed.
    pub fn apply_patch(&mut self, ts: Timestamp, origin: &str, patch: &Value) -> Result<()> {
        let Value::Object(map) = patch else {
            return Err(CrdtError::InvalidPatchShape(
                "patch must be a JSON object".into(),
            ));
        };
        let mut writes = Vec::new();
        collect_writes(&mut Vec::new(), map, &mut writes)?;
        for (path, value) in writes {
            self.set(ts, origin, path, value);
        }
        Ok(())
    }

    /// Write a single register directly.
    pub fn set(&mut self, ts: Timestamp, origin: &str, path: Path, value: RegisterValue) {
        self.registers
            .entry(path)
            .or_default()
            .insert((ts, origin.to_owned()), value);
    }

    /// The winning value at a path, ignoring list chunks.
    #[must_use]
    pub fn get(&self, path: &[String]) -> Option<&Value> {
        self.get_with_origin(path).map(|(_, _, v)| v)
    }

    /// The winning value at a path along with the write that produced it.
    #[must_use]
    pub fn get_with_origin(&self, path: &[String]) -> Option<(Timestamp, &str, &Value)> {
        self.registers.get(path)?.iter().rev().find_map(
            |((ts, origin), value)| match value {
                RegisterValue::Scalar(v) | RegisterValue::AtomicObject(v) => {
                    Some((*ts, origin.as_str(), v))
                }
                RegisterValue::ListChunk(_) => None,
            },
        )
    }

    /// All list elements at a path, chunks concatenated in write order.
    #[must_use]
    pub fn list(&self, path: &[String]) -> Vec<Value> {
        let mut out = Vec::new();
        self.for_each_list_chunk(path, |_, _, chunk| {
            out.extend_from_slice(chunk);
            true
        });
        out
    }

    /// Visit list chunks at a path in ascending `(timestamp, origin)`
    /// order. Stops early when the callback returns `false`.
    pub fn for_each_list_chunk(
        &self,
        path: &[String],
        mut f: impl FnMut(Timestamp, &str, &[Value]) -> bool,
    ) {
        let Some(register) = self.registers.get(path) else {
            return;
        };
        for ((ts, origin), value) in register {
            if let RegisterValue::ListChunk(chunk) = value
                && !f(*ts, origin, chunk)
            {
                return;
            }
        }
    }

    /// Immediate child keys under a path prefix, sorted and deduplicated.
    #[must_use]
    pub fn keys(&self, prefix: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for path in self.registers.keys() {
            if path.len() > prefix.len()
                && path.starts_with(prefix)
                && out.last() != Some(&path[prefix.len()])
            {
                out.push(path[prefix.len()].clone());
            }
        }
        out
    }

    /// Drop every write keyed by exactly `(ts, origin)`, across all paths.
    /// Used to retract a staged draft before re-staging it.
    pub fn forget_state(&mut self, ts: Timestamp, origin: &str) {
        let key = (ts, origin.to_owned());
        self.registers.retain(|_, register| {
            register.remove(&key);
            !register.is_empty()
        });
    }
}

/// Walk a patch object, validating tags and flattening leaves into
/// `(path, value)` writes. Mutates nothing until the whole patch parses.
fn collect_writes(
    path: &mut Path,
    map: &serde_json::Map<String, Value>,
    out: &mut Vec<(Path, RegisterValue)>,
) -> Result<()> {
    if let Some(inner) = map.get("#map") {
        if map.len() != 1 {
            return Err(CrdtError::InvalidPatchShape(
                "#map must be the only key of its object".into(),
            ));
        }
        if !inner.is_object() {
            return Err(CrdtError::InvalidPatchShape(
                "#map value must be an object".into(),
            ));
        }
        let mut full = path.clone();
        full.push("#map".into());
        out.push((full, RegisterValue::AtomicObject(inner.clone())));
        return Ok(());
    }

    if let Some(inner) = map.get("#list") {
        if map.len() != 1 {
            return Err(CrdtError::InvalidPatchShape(
                "#list must be the only key of its object".into(),
            ));
        }
        let items = match inner {
            Value::Array(items) => items.clone(),
            Value::Object(obj) => match (obj.len(), obj.get("#ins")) {
                (1, Some(Value::Array(items))) => items.clone(),
                _ => {
                    return Err(CrdtError::InvalidPatchShape(
                        "#list object form must be {\"#ins\": [...]}".into(),
                    ));
                }
            },
            _ => {
                return Err(CrdtError::InvalidPatchShape(
                    "#list value must be an array or an #ins object".into(),
                ));
            }
        };
        out.push((path.clone(), RegisterValue::ListChunk(items)));
        return Ok(());
    }

    for (key, value) in map {
        if key.starts_with('#') {
            return Err(CrdtError::InvalidPatchShape(format!(
                "unknown tag key {key:?}"
            )));
        }
        path.push(key.clone());
        match value {
            Value::Object(inner) => collect_writes(path, inner, out)?,
            other => out.push((path.clone(), RegisterValue::Scalar(other.clone()))),
        }
        path.pop();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
