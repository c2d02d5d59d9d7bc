#![forbid(unsafe_code)]
//! Paged, key-ordered iteration over a btrfs tree of a mounted filesystem.
//!
//! The kernel exposes tree contents through a ranged search that returns at
//! most one buffer of items per call. [`TreeIterator`] turns repeated calls
//! into a lazy stream of [`SearchItem`]s in strictly increasing key order.
//! I/O-agnostic: callers provide a [`TreeSearch`] implementation (the ioctl
//! backend in production, an in-memory tree in tests).

pub mod control;

pub use bsc_ondisk::{BtrfsKey, SearchItem};
pub use control::{FeatureFlags, FsControl, FsInfo};

use bsc_error::{CheckError, Result};
use bsc_types::TreeId;
use tracing::trace;

/// Items requested per search call.
pub const DEFAULT_BATCH_ITEMS: u32 = 4096;

/// The range of a tree search: a compound key range plus a transaction range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchKey {
    pub tree: TreeId,
    pub min: BtrfsKey,
    pub max: BtrfsKey,
    pub min_transid: u64,
    pub max_transid: u64,
}

impl SearchKey {
    /// Every item of `tree`.
    #[must_use]
    pub fn whole_tree(tree: TreeId) -> Self {
        Self::range(tree, BtrfsKey::MIN, BtrfsKey::MAX)
    }

    /// Items of `tree` with `min <= key <= max`, from any transaction.
    #[must_use]
    pub fn range(tree: TreeId, min: BtrfsKey, max: BtrfsKey) -> Self {
        Self {
            tree,
            min,
            max,
            min_transid: 0,
            max_transid: u64::MAX,
        }
    }
}

/// The bulk ranged query primitive.
pub trait TreeSearch {
    /// Return up to `nr_items` items of `key.tree` within `key`'s range, in
    /// ascending key order, starting at the first item `>= key.min`.
    ///
    /// An empty result means there are no more items in the range.
    fn search(&self, key: &SearchKey, nr_items: u32) -> std::io::Result<Vec<SearchItem>>;
}

impl<T: TreeSearch + ?Sized> TreeSearch for &T {
    fn search(&self, key: &SearchKey, nr_items: u32) -> std::io::Result<Vec<SearchItem>> {
        (**self).search(key, nr_items)
    }
}

/// Lazy iterator over the items of one search range.
///
/// Yields `Err(CheckError::Query)` once if the search primitive fails, then
/// ends. Normal exhaustion simply ends the iteration.
pub struct TreeIterator<'a, S: TreeSearch + ?Sized> {
    search: &'a S,
    key: SearchKey,
    batch: u32,
    page: std::vec::IntoIter<SearchItem>,
    done: bool,
    pages_fetched: u64,
    items_returned: u64,
}

impl<'a, S: TreeSearch + ?Sized> TreeIterator<'a, S> {
    #[must_use]
    pub fn new(search: &'a S, key: SearchKey) -> Self {
        Self::with_batch(search, key, DEFAULT_BATCH_ITEMS)
    }

    #[must_use]
    pub fn with_batch(search: &'a S, key: SearchKey, batch: u32) -> Self {
        Self {
            search,
            key,
            batch: batch.max(1),
            page: Vec::new().into_iter(),
            done: false,
            pages_fetched: 0,
            items_returned: 0,
        }
    }

    /// Restart the iteration at `start`, dropping any buffered items.
    ///
    /// The upper bound of the range is unchanged.
    pub fn reset(&mut self, start: BtrfsKey) {
        self.key.min = start;
        self.page = Vec::new().into_iter();
        self.done = false;
    }

    #[must_use]
    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    #[must_use]
    pub fn items_returned(&self) -> u64 {
        self.items_returned
    }

    fn fetch_page(&mut self) -> Result<bool> {
        let items = self
            .search
            .search(&self.key, self.batch)
            .map_err(|source| CheckError::Query {
                tree: self.key.tree.0,
                source,
            })?;
        self.pages_fetched += 1;
        trace!(
            tree = self.key.tree.0,
            min = %self.key.min,
            items = items.len(),
            "fetched search page"
        );
        if items.is_empty() {
            return Ok(false);
        }
        self.page = items.into_iter();
        Ok(true)
    }
}

impl<S: TreeSearch + ?Sized> Iterator for TreeIterator<'_, S> {
    type Item = Result<SearchItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.page.next() {
                match item.key.successor() {
                    Some(next) => self.key.min = next,
                    None => self.done = true,
                }
                self.items_returned += 1;
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            match self.fetch_page() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
