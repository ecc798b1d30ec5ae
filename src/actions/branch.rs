//! Branch snapshots of the tabular context.

use rustc_hash::FxHashMap;
use tracing::debug;

use super::Metadata;
use crate::error::{Error, ResolutionError, Result};
use crate::model::{edges, NodeRecord};
use crate::table::{JoinKind, Table};

/// Key a BranchSave node stores under.
fn save_key(node: &NodeRecord) -> String {
    node.prop_str("branch")
        .filter(|b| !b.is_empty())
        .unwrap_or(&node.id)
        .to_owned()
}

/// Snapshots owned by one run.
#[derive(Clone, Debug, Default)]
pub struct BranchStore {
    snapshots: FxHashMap<String, Table>,
}

impl BranchStore {
    /// Stores a copy of `table` under `key`, replacing an earlier one.
    pub fn save(&mut self, key: &str, table: &Table) {
        debug!(key, rows = table.len(), "actions.branch.saved");
        self.snapshots.insert(key.to_owned(), table.clone());
    }

    /// Copy of the snapshot under `key`.
    pub fn load(&self, key: &str) -> Result<Table> {
        self.snapshots
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BranchMissing {
                key: key.to_owned(),
            })
    }

    /// Outer natural join of `current` with every snapshot in `keys`.
    ///
    /// A context without columns does not take part in the join.
    pub fn combine(&self, keys: &[String], current: Table) -> Result<Table> {
        let mut combined = if current.columns().is_empty() {
            None
        } else {
            Some(current)
        };
        for key in keys {
            let snapshot = self.snapshots.get(key).ok_or_else(|| Error::BranchMissing {
                key: key.clone(),
            })?;
            combined = Some(match combined {
                None => snapshot.clone(),
                Some(table) => table.join(snapshot, JoinKind::Outer)?,
            });
        }
        Ok(combined.unwrap_or_default())
    }

    /// True when `key` was saved.
    pub fn contains(&self, key: &str) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Number of snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// True when nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Saves the context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchSave {
    /// Snapshot key.
    pub key: String,
}

impl BranchSave {
    pub(crate) fn from_metadata(node: &NodeRecord) -> Self {
        Self {
            key: save_key(node),
        }
    }
}

/// Replaces the context with a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchLoad {
    /// Snapshot key.
    pub key: String,
}

impl BranchLoad {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        if let Some(key) = node.prop_str("branch").filter(|b| !b.is_empty()) {
            return Ok(Self {
                key: key.to_owned(),
            });
        }
        meta.doc
            .outgoing(&node.id, edges::METHOD_BRANCH)
            .next()
            .map(|(_, save)| Self {
                key: save_key(save),
            })
            .ok_or_else(|| ResolutionError::missing(&node.id, "'branch' property or METHOD_BRANCH edge"))
    }
}

/// Joins snapshots into the context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchCombine {
    /// Snapshot keys, joined in order.
    pub keys: Vec<String>,
}

impl BranchCombine {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        let keys: Vec<String> = meta
            .doc
            .outgoing(&node.id, edges::METHOD_BRANCH)
            .map(|(_, save)| save_key(save))
            .collect();
        if keys.is_empty() {
            return Err(ResolutionError::missing(&node.id, "METHOD_BRANCH edges"));
        }
        Ok(Self { keys })
    }
}
