//! Bucket tree and write overlay
//!
//! Committed state is an immutable tree of `Node`s shared through `Arc`, so a
//! reader's snapshot is one pointer clone. A write transaction never touches
//! the tree; it records its changes in a `Pending` overlay of the same shape.
//! Commit applies the overlay with `Arc::make_mut`, which copies only the
//! nodes a live reader snapshot still shares.
//!
//! ```text
//!   committed: Arc<Node> ──► readers (snapshots)
//!        ▲
//!        │ apply(pending) on commit
//!   WriteTx { base: Arc<Node>, pending: Pending }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One bucket: ordered key/value entries plus nested buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub(crate) entries: BTreeMap<Vec<u8>, Vec<u8>>,
    pub(crate) children: BTreeMap<Vec<u8>, Arc<Node>>,
}

impl Node {
    /// Number of entries in this bucket and all nested buckets.
    pub fn total_entries(&self) -> usize {
        self.entries.len()
            + self
                .children
                .values()
                .map(|c| c.total_entries())
                .sum::<usize>()
    }
}

/// Uncommitted changes to one bucket.
///
/// `None` entry values are deletions. A `fresh` overlay hides the base bucket
/// entirely (the bucket was created, or dropped and re-created, in this
/// transaction). A `dropped` overlay deletes the bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pending {
    pub(crate) dropped: bool,
    pub(crate) fresh: bool,
    pub(crate) entries: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pub(crate) children: BTreeMap<Vec<u8>, Pending>,
}

impl Pending {
    pub(crate) fn created() -> Self {
        Pending {
            fresh: true,
            ..Default::default()
        }
    }

    pub(crate) fn dropped() -> Self {
        Pending {
            dropped: true,
            ..Default::default()
        }
    }

    /// True when applying this overlay would change nothing.
    pub fn is_empty(&self) -> bool {
        !self.dropped
            && !self.fresh
            && self.entries.is_empty()
            && self.children.values().all(Pending::is_empty)
    }
}

/// Apply an overlay to a committed node.
pub(crate) fn apply(node: &mut Arc<Node>, pending: Pending) {
    if pending.is_empty() {
        return;
    }
    let node = Arc::make_mut(node);
    if pending.fresh {
        node.entries.clear();
        node.children.clear();
    }
    for (key, value) in pending.entries {
        match value {
            Some(value) => {
                node.entries.insert(key, value);
            }
            None => {
                node.entries.remove(&key);
            }
        }
    }
    for (name, child) in pending.children {
        if child.dropped {
            node.children.remove(&name);
            continue;
        }
        if child.is_empty() {
            continue;
        }
        let slot = node.children.entry(name).or_default();
        apply(slot, child);
    }
}
