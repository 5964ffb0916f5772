//! Bucket views and cursors
//!
//! A `BucketView` reads one bucket as the owning transaction sees it: the base
//! snapshot with the transaction's own overlay (if any) laid on top. Read-only
//! transactions have no overlay, so the same code serves both modes.

use super::node::{Node, Pending};
use std::ops::Bound;

/// `(key, value)` borrowed from the transaction.
pub type Entry<'a> = (&'a [u8], &'a [u8]);

/// Read access to one bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketView<'a> {
    base: Option<&'a Node>,
    pending: Option<&'a Pending>,
}

impl<'a> BucketView<'a> {
    pub(crate) fn new(base: Option<&'a Node>, pending: Option<&'a Pending>) -> Self {
        BucketView { base, pending }
    }

    /// Base node, unless the overlay replaces it.
    fn base_live(&self) -> Option<&'a Node> {
        match self.pending {
            Some(p) if p.fresh => None,
            _ => self.base,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&'a [u8]> {
        if let Some(pending) = self.pending {
            if let Some(value) = pending.entries.get(key) {
                return value.as_deref();
            }
        }
        self.base_live()?.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Nested bucket, or `None` if it does not exist.
    pub fn child(&self, name: &[u8]) -> Option<BucketView<'a>> {
        let base_child = self
            .base_live()
            .and_then(|n| n.children.get(name))
            .map(|c| c.as_ref());
        match self.pending.and_then(|p| p.children.get(name)) {
            Some(p) if p.dropped => None,
            Some(p) if p.fresh || base_child.is_some() => Some(BucketView::new(base_child, Some(p))),
            Some(_) => None,
            None => base_child.map(|b| BucketView::new(Some(b), None)),
        }
    }

    /// Names of nested buckets, sorted.
    pub fn child_names(&self) -> Vec<Vec<u8>> {
        let mut names: Vec<Vec<u8>> = self
            .base_live()
            .map(|n| n.children.keys().cloned().collect())
            .unwrap_or_default();
        if let Some(pending) = self.pending {
            for name in pending.children.keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names.retain(|n| self.child(n).is_some());
        names.sort();
        names
    }

    pub fn cursor(&self) -> Cursor<'a> {
        Cursor {
            view: *self,
            position: None,
        }
    }

    /// Iterate entries with keys in `[from, ..)`.
    pub fn iter_from(&self, from: &[u8]) -> Iter<'a> {
        let mut cursor = self.cursor();
        let first = cursor.seek(from);
        Iter {
            cursor,
            pending: first,
        }
    }

    pub fn iter(&self) -> Iter<'a> {
        let mut cursor = self.cursor();
        let first = cursor.first();
        Iter {
            cursor,
            pending: first,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor().first().is_none()
    }

    /// Smallest visible entry within `from`.
    fn find_forward(&self, from: Bound<&[u8]>) -> Option<Entry<'a>> {
        let mut bound = from;
        loop {
            let base = self
                .base_live()
                .and_then(|n| n.entries.range::<[u8], _>((bound, Bound::Unbounded)).next());
            let over = self
                .pending
                .and_then(|p| p.entries.range::<[u8], _>((bound, Bound::Unbounded)).next());
            match (base, over) {
                (None, None) => return None,
                (Some((bk, bv)), None) => return Some((bk.as_slice(), bv.as_slice())),
                (Some((bk, bv)), Some((ok, _))) if bk < ok => {
                    return Some((bk.as_slice(), bv.as_slice()))
                }
                (_, Some((ok, ov))) => match ov {
                    Some(v) => return Some((ok.as_slice(), v.as_slice())),
                    None => bound = Bound::Excluded(ok.as_slice()),
                },
            }
        }
    }

    /// Largest visible entry within `to`.
    fn find_backward(&self, to: Bound<&[u8]>) -> Option<Entry<'a>> {
        let mut bound = to;
        loop {
            let base = self.base_live().and_then(|n| {
                n.entries
                    .range::<[u8], _>((Bound::Unbounded, bound))
                    .next_back()
            });
            let over = self.pending.and_then(|p| {
                p.entries
                    .range::<[u8], _>((Bound::Unbounded, bound))
                    .next_back()
            });
            match (base, over) {
                (None, None) => return None,
                (Some((bk, bv)), None) => return Some((bk.as_slice(), bv.as_slice())),
                (Some((bk, bv)), Some((ok, _))) if bk > ok => {
                    return Some((bk.as_slice(), bv.as_slice()))
                }
                (_, Some((ok, ov))) => match ov {
                    Some(v) => return Some((ok.as_slice(), v.as_slice())),
                    None => bound = Bound::Excluded(ok.as_slice()),
                },
            }
        }
    }
}

/// Ordered cursor over one bucket.
///
/// Positioning calls return the entry the cursor lands on; running off either
/// end returns `None` and unpositions the cursor.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    view: BucketView<'a>,
    position: Option<&'a [u8]>,
}

#[allow(clippy::should_implement_trait)]
impl<'a> Cursor<'a> {
    pub fn first(&mut self) -> Option<Entry<'a>> {
        let found = self.view.find_forward(Bound::Unbounded);
        self.settle(found)
    }

    pub fn last(&mut self) -> Option<Entry<'a>> {
        let found = self.view.find_backward(Bound::Unbounded);
        self.settle(found)
    }

    /// First entry with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Option<Entry<'a>> {
        let found = self.view.find_forward(Bound::Included(key));
        self.settle(found)
    }

    pub fn next(&mut self) -> Option<Entry<'a>> {
        let found = match self.position {
            Some(at) => self.view.find_forward(Bound::Excluded(at)),
            None => None,
        };
        self.settle(found)
    }

    pub fn prev(&mut self) -> Option<Entry<'a>> {
        let found = match self.position {
            Some(at) => self.view.find_backward(Bound::Excluded(at)),
            None => None,
        };
        self.settle(found)
    }

    /// Entry under the cursor.
    pub fn current(&self) -> Option<Entry<'a>> {
        let key = self.position?;
        self.view.get(key).map(|v| (key, v))
    }

    fn settle(&mut self, found: Option<Entry<'a>>) -> Option<Entry<'a>> {
        self.position = found.map(|(k, _)| k);
        found
    }
}

/// Forward iterator built on a cursor.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    cursor: Cursor<'a>,
    pending: Option<Entry<'a>>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let out = self.pending.take()?;
        self.pending = self.cursor.next();
        Some(out)
    }
}
