//! Forward iteration over the leaves.

use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::storage::Storage;
use crate::tier::ReadGuard;
use crate::tree::Shared;

/// A read position in the tree.
///
/// A cursor holds a read lock on the leaf it is in, so writers to that leaf
/// wait until it moves on or is released. Moving to the next leaf takes the
/// next lock before letting go of the current one. Release cursors you stop
/// using early, or drop them.
///
/// Cursors from [`Strata::find`](crate::Strata::find) stop after the last
/// value with the sought key; the others run to the end of the tree.
pub struct Cursor<K, V, S>
where
    S: Storage<K, V>,
{
    shared: Arc<Shared<K, V, S>>,
    leaf: Option<ReadGuard<K, V, S::Address>>,
    index: usize,
    bound: Option<K>,
}

impl<K, V, S> Cursor<K, V, S>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    pub(crate) fn new(
        shared: Arc<Shared<K, V, S>>,
        leaf: ReadGuard<K, V, S::Address>,
        index: usize,
        bound: Option<K>,
    ) -> Result<Self> {
        let mut cursor = Cursor {
            shared,
            leaf: Some(leaf),
            index,
            bound,
        };
        cursor.settle()?;
        Ok(cursor)
    }

    /// True if `next_value` has something to return.
    pub fn has_next(&self) -> bool {
        self.leaf.is_some()
    }

    /// The value under the cursor, moving past it.
    pub fn next_value(&mut self) -> Result<V> {
        let leaf = self
            .leaf
            .as_ref()
            .ok_or(StrataError::IllegalState("cursor has been released"))?;
        let value = leaf
            .leaf()?
            .buckets
            .get(self.index)
            .map(|b| b.value.clone())
            .ok_or(StrataError::IllegalState("cursor is past the end"))?;
        self.index += 1;
        self.settle()?;
        Ok(value)
    }

    /// Let go of the leaf lock. Calling this more than once is harmless.
    pub fn release(&mut self) {
        self.leaf = None;
    }

    /// Move forward until the cursor is on a value, or release it when
    /// there are none left.
    fn settle(&mut self) -> Result<()> {
        loop {
            // Either the cursor is on a value, and whether that value is past
            // the bound, or the leaf is used up and this is the next one.
            let (past, next) = match self.leaf.as_ref() {
                None => return Ok(()),
                Some(guard) => {
                    let leaf = guard.leaf()?;
                    match leaf.buckets.get(self.index) {
                        Some(bucket) => {
                            let past = self
                                .bound
                                .as_ref()
                                .map(|bound| *self.shared.keys.key(bucket) != *bound)
                                .unwrap_or(false);
                            (past, None)
                        }
                        None => (false, Some(leaf.next)),
                    }
                }
            };
            let next = match next {
                Some(next) => next,
                None => {
                    if past {
                        self.release();
                    }
                    return Ok(());
                }
            };
            if self.shared.storage.is_null(next) {
                self.release();
                return Ok(());
            }
            // The next lock is taken before the current one is dropped.
            let following = self.shared.pool.get(next)?.read_arc();
            self.leaf = Some(following);
            self.index = 0;
        }
    }
}

impl<K, V, S> Iterator for Cursor<K, V, S>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        Some(self.next_value())
    }
}
