//! Arena index over the METHOD_ACTION/NEXT tree of a method document.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::error::ResolutionError;
use crate::model::{edges, MethodDocument, NodeRecord};

/// Handle of a method in a [`ChainIndex`].
pub type MethodIdx = usize;

/// Parent → ordered children adjacency, built once per resolution.
#[derive(Debug)]
pub struct ChainIndex<'d> {
    nodes: Vec<&'d NodeRecord>,
    children: Vec<Vec<MethodIdx>>,
}

impl<'d> ChainIndex<'d> {
    /// Indexes every method reachable from the document root, ordering each
    /// sibling group along its NEXT path.
    pub fn build(doc: &'d MethodDocument) -> Result<Self, ResolutionError> {
        let root = doc.root().ok_or_else(|| ResolutionError::MissingRoot {
            name: doc.name.clone(),
        })?;
        let mut index = ChainIndex {
            nodes: vec![root],
            children: vec![Vec::new()],
        };
        let mut by_id: FxHashMap<&'d str, MethodIdx> = FxHashMap::default();
        by_id.insert(root.id.as_str(), 0);

        let mut cursor = 0;
        while cursor < index.nodes.len() {
            let parent = index.nodes[cursor];
            let ordered = order_siblings(doc, parent)?;
            let mut handles = Vec::with_capacity(ordered.len());
            for child in ordered {
                if by_id.contains_key(child.id.as_str()) {
                    return Err(ResolutionError::BrokenChain {
                        parent: parent.id.clone(),
                        at: child.id.clone(),
                    });
                }
                let handle = index.nodes.len();
                by_id.insert(child.id.as_str(), handle);
                index.nodes.push(child);
                index.children.push(Vec::new());
                handles.push(handle);
            }
            trace!(parent = %parent.id, children = handles.len(), "engine.resolve.chain");
            index.children[cursor] = handles;
            cursor += 1;
        }
        Ok(index)
    }

    /// Root handle.
    pub fn root(&self) -> MethodIdx {
        0
    }

    /// Method record behind a handle.
    pub fn node(&self, idx: MethodIdx) -> &'d NodeRecord {
        self.nodes[idx]
    }

    /// Ordered children of a handle.
    pub fn children(&self, idx: MethodIdx) -> &[MethodIdx] {
        &self.children[idx]
    }

    /// Number of indexed methods, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: the root is indexed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// METHOD_ACTION children of `parent` in NEXT order.
fn order_siblings<'d>(
    doc: &'d MethodDocument,
    parent: &'d NodeRecord,
) -> Result<Vec<&'d NodeRecord>, ResolutionError> {
    let siblings: Vec<&'d NodeRecord> = doc
        .outgoing(&parent.id, edges::METHOD_ACTION)
        .map(|(_, child)| child)
        .collect();
    if siblings.is_empty() {
        return Ok(siblings);
    }
    let broken = |at: &str| ResolutionError::BrokenChain {
        parent: parent.id.clone(),
        at: at.to_owned(),
    };
    let members: FxHashSet<&str> = siblings.iter().map(|n| n.id.as_str()).collect();
    let mut next: FxHashMap<&str, &'d NodeRecord> = FxHashMap::default();
    let mut has_incoming: FxHashSet<&str> = FxHashSet::default();
    for node in &siblings {
        let mut targets = doc.outgoing(&node.id, edges::NEXT);
        if let Some((_, target)) = targets.next() {
            if targets.next().is_some() || !members.contains(target.id.as_str()) {
                return Err(broken(&node.id));
            }
            if !has_incoming.insert(target.id.as_str()) {
                return Err(broken(&target.id));
            }
            next.insert(node.id.as_str(), target);
        }
    }
    let entries: Vec<&'d NodeRecord> = siblings
        .iter()
        .copied()
        .filter(|n| !has_incoming.contains(n.id.as_str()))
        .collect();
    let entry = match entries.as_slice() {
        [] => {
            return Err(ResolutionError::NoEntry {
                parent: parent.id.clone(),
            })
        }
        [entry] => *entry,
        many => {
            let mut ids: Vec<String> = many.iter().map(|n| n.id.clone()).collect();
            ids.sort();
            return Err(ResolutionError::AmbiguousEntry {
                parent: parent.id.clone(),
                entries: ids,
            });
        }
    };

    let mut ordered = vec![entry];
    let mut visited: FxHashSet<&str> = FxHashSet::from_iter([entry.id.as_str()]);
    let mut current = entry;
    while let Some(&following) = next.get(current.id.as_str()) {
        if !visited.insert(following.id.as_str()) {
            return Err(broken(&following.id));
        }
        ordered.push(following);
        current = following;
    }
    if ordered.len() != siblings.len() {
        let stray = siblings
            .iter()
            .find(|n| !visited.contains(n.id.as_str()))
            .map(|n| n.id.as_str())
            .unwrap_or(parent.id.as_str());
        return Err(broken(stray));
    }
    Ok(ordered)
}
