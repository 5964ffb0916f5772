//! Transactions
//!
//! `ReadTx` holds a committed snapshot. `WriteTx` holds the snapshot it
//! started from plus its overlay; everything it reads goes through the
//! overlay so a writer sees its own uncommitted changes.

use super::bucket::BucketView;
use super::node::{Node, Pending};
use super::StoreError;
use std::sync::Arc;

/// Read access shared by both transaction kinds.
pub trait Transaction {
    /// The root namespace. Holds buckets only.
    fn root(&self) -> BucketView<'_>;

    /// Bucket at `path`, or `None` if any element is missing.
    fn bucket(&self, path: &[&str]) -> Option<BucketView<'_>> {
        let mut view = self.root();
        for name in path {
            view = view.child(name.as_bytes())?;
        }
        Some(view)
    }
}

/// Read-only transaction over a committed snapshot.
pub struct ReadTx {
    root: Arc<Node>,
}

impl ReadTx {
    pub(crate) fn new(root: Arc<Node>) -> Self {
        ReadTx { root }
    }
}

impl Transaction for ReadTx {
    fn root(&self) -> BucketView<'_> {
        BucketView::new(Some(&self.root), None)
    }
}

/// Read-write transaction.
pub struct WriteTx {
    base: Arc<Node>,
    pending: Pending,
    txid: u64,
}

impl Transaction for WriteTx {
    fn root(&self) -> BucketView<'_> {
        BucketView::new(Some(&self.base), Some(&self.pending))
    }
}

impl WriteTx {
    pub(crate) fn new(base: Arc<Node>, txid: u64) -> Self {
        WriteTx {
            base,
            pending: Pending::default(),
            txid,
        }
    }

    pub(crate) fn into_pending(self) -> (u64, Pending) {
        (self.txid, self.pending)
    }

    /// Id this transaction commits under.
    pub fn txid(&self) -> u64 {
        self.txid
    }

    /// Writable handle on an existing bucket.
    pub fn bucket_mut(&mut self, path: &[&str]) -> Option<BucketMut<'_>> {
        if path.is_empty() || self.bucket(path).is_none() {
            return None;
        }
        Some(BucketMut {
            path: to_path(path),
            tx: self,
        })
    }

    /// Create every missing bucket along `path` and return the last one.
    pub fn create_bucket_if_not_exists(&mut self, path: &[&str]) -> Result<BucketMut<'_>, StoreError> {
        if path.is_empty() {
            return Err(StoreError::InvalidBucket(String::new()));
        }
        let full = to_path(path);
        for depth in 0..full.len() {
            if self.bucket(&path[..=depth]).is_some() {
                continue;
            }
            let parent = self.pending_at(&full[..depth]);
            parent
                .children
                .insert(full[depth].clone(), Pending::created());
        }
        Ok(BucketMut {
            path: full,
            tx: self,
        })
    }

    /// Drop the bucket at `path` with everything under it.
    pub fn delete_bucket(&mut self, path: &[&str]) -> Result<(), StoreError> {
        if path.is_empty() || self.bucket(path).is_none() {
            return Err(StoreError::BucketNotFound(path.join("/")));
        }
        let full = to_path(path);
        let (name, parent_path) = match full.split_last() {
            Some(split) => split,
            None => return Err(StoreError::BucketNotFound(String::new())),
        };
        let name = name.clone();
        let parent_path = parent_path.to_vec();
        self.pending_at(&parent_path)
            .children
            .insert(name, Pending::dropped());
        Ok(())
    }

    /// Overlay node for `path`, created along the way.
    fn pending_at(&mut self, path: &[Vec<u8>]) -> &mut Pending {
        let mut node = &mut self.pending;
        for name in path {
            node = node.children.entry(name.clone()).or_default();
        }
        node
    }
}

fn to_path(path: &[&str]) -> Vec<Vec<u8>> {
    path.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Writable handle on one bucket of a `WriteTx`.
pub struct BucketMut<'t> {
    tx: &'t mut WriteTx,
    path: Vec<Vec<u8>>,
}

impl BucketMut<'_> {
    /// Current contents, including this transaction's writes.
    pub fn view(&self) -> BucketView<'_> {
        let mut view = self.tx.root();
        for name in &self.path {
            match view.child(name) {
                Some(child) => view = child,
                None => return BucketView::new(None, None),
            }
        }
        view
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let view = self.view();
        view.get(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        let path = self.path.clone();
        self.tx
            .pending_at(&path)
            .entries
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    /// Remove `key`. Removing an absent key is not an error.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        let path = self.path.clone();
        self.tx.pending_at(&path).entries.insert(key.to_vec(), None);
        Ok(())
    }
}
