//! Tiers are the nodes of the tree. An inner tier holds branches, a leaf tier
//! holds buckets and the address of the next leaf in key order.
//!
//! Every live tier sits behind its own reader-writer lock. The lock is an
//! `Arc` lock so that guards can be owned by a `Level` or a `Cursor` without
//! borrowing from the pool.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{RawRwLock, RwLock};

use crate::error::{Result, StrataError};

/// An opaque storage address. The engine only ever copies and compares them.
pub trait Address: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> Address for T {}

/// What kind of tier the children of an inner tier are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    /// Children are inner tiers.
    Inner,
    /// Children are leaves.
    Leaf,
}

/// The two kinds of tier, used when asking storage for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    /// A tier of branches.
    Inner,
    /// A tier of buckets.
    Leaf,
}

/// A pivot and the address of the subtree it leads to. The first branch of
/// every inner tier has no pivot, which orders before everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch<K, A> {
    /// Smallest key reachable through `address`, `None` when minimal.
    pub pivot: Option<K>,
    /// Child tier.
    pub address: A,
}

/// A leaf entry. The key is only present when the schema caches fields,
/// otherwise it is derived from the value on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket<K, V> {
    /// Cached key, if any.
    pub key: Option<K>,
    /// The stored value.
    pub value: V,
}

/// A tier of branches.
#[derive(Debug, Clone)]
pub struct InnerTier<K, A> {
    /// Address of this tier.
    pub address: A,
    /// Kind of the children.
    pub child_type: ChildType,
    /// Branches ordered by pivot.
    pub branches: Vec<Branch<K, A>>,
}

/// A tier of buckets.
#[derive(Debug, Clone)]
pub struct LeafTier<K, V, A> {
    /// Address of this tier.
    pub address: A,
    /// Next leaf in key order, or the storage null address.
    pub next: A,
    /// Buckets ordered by key.
    pub buckets: Vec<Bucket<K, V>>,
}

/// A node of the tree as it is loaded from and written to storage.
#[derive(Debug, Clone)]
pub enum Tier<K, V, A> {
    /// A tier of branches.
    Inner(InnerTier<K, A>),
    /// A tier of buckets.
    Leaf(LeafTier<K, V, A>),
}

pub(crate) type TierRef<K, V, A> = Arc<RwLock<Tier<K, V, A>>>;
pub(crate) type ReadGuard<K, V, A> = lock_api::ArcRwLockReadGuard<RawRwLock, Tier<K, V, A>>;
pub(crate) type WriteGuard<K, V, A> = lock_api::ArcRwLockWriteGuard<RawRwLock, Tier<K, V, A>>;

impl<K, V, A: Address> Tier<K, V, A> {
    /// Address of this tier.
    pub fn address(&self) -> A {
        match self {
            Tier::Inner(inner) => inner.address,
            Tier::Leaf(leaf) => leaf.address,
        }
    }

    /// Number of branches or buckets.
    pub fn len(&self) -> usize {
        match self {
            Tier::Inner(inner) => inner.branches.len(),
            Tier::Leaf(leaf) => leaf.buckets.len(),
        }
    }

    /// True when there are no branches or buckets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The kind of this tier.
    pub fn kind(&self) -> TierKind {
        match self {
            Tier::Inner(_) => TierKind::Inner,
            Tier::Leaf(_) => TierKind::Leaf,
        }
    }

    pub(crate) fn inner(&self) -> Result<&InnerTier<K, A>> {
        match self {
            Tier::Inner(inner) => Ok(inner),
            Tier::Leaf(leaf) => Err(StrataError::corrupt(format!(
                "expected inner tier at {:?}, found a leaf",
                leaf.address
            ))),
        }
    }

    pub(crate) fn inner_mut(&mut self) -> Result<&mut InnerTier<K, A>> {
        match self {
            Tier::Inner(inner) => Ok(inner),
            Tier::Leaf(leaf) => Err(StrataError::corrupt(format!(
                "expected inner tier at {:?}, found a leaf",
                leaf.address
            ))),
        }
    }

    pub(crate) fn leaf(&self) -> Result<&LeafTier<K, V, A>> {
        match self {
            Tier::Leaf(leaf) => Ok(leaf),
            Tier::Inner(inner) => Err(StrataError::corrupt(format!(
                "expected leaf tier at {:?}, found an inner tier",
                inner.address
            ))),
        }
    }

    pub(crate) fn leaf_mut(&mut self) -> Result<&mut LeafTier<K, V, A>> {
        match self {
            Tier::Leaf(leaf) => Ok(leaf),
            Tier::Inner(inner) => Err(StrataError::corrupt(format!(
                "expected leaf tier at {:?}, found an inner tier",
                inner.address
            ))),
        }
    }
}

impl<K: Ord, A: Address> InnerTier<K, A> {
    pub(crate) fn new(address: A, child_type: ChildType) -> Self {
        InnerTier {
            address,
            child_type,
            branches: Vec::new(),
        }
    }

    /// Index of the branch to follow for `key`: the last branch whose pivot
    /// is not greater than the key. The minimal first branch always matches.
    pub(crate) fn find(&self, key: &K) -> usize {
        let mut idx = 0;
        for (i, branch) in self.branches.iter().enumerate().skip(1) {
            match &branch.pivot {
                Some(pivot) if pivot <= key => idx = i,
                _ => break,
            }
        }
        idx
    }

    pub(crate) fn index_of(&self, address: A) -> Option<usize> {
        self.branches.iter().position(|b| b.address == address)
    }

    pub(crate) fn address_at(&self, idx: usize) -> Result<A> {
        self.branches.get(idx).map(|b| b.address).ok_or_else(|| {
            StrataError::corrupt(format!(
                "branch {} out of range in inner tier {:?}",
                idx, self.address
            ))
        })
    }

    /// Remove the branch at `idx`. When the first branch goes, the pivot of
    /// the new first branch is taken out and returned, since it now sits
    /// in the minimal position.
    pub(crate) fn remove_branch(&mut self, idx: usize) -> (Branch<K, A>, Option<K>) {
        let removed = self.branches.remove(idx);
        let promoted = if idx == 0 {
            self.branches.first_mut().and_then(|b| b.pivot.take())
        } else {
            None
        };
        (removed, promoted)
    }

    /// Move the upper half of the branches out. The first moved branch keeps
    /// its pivot in the returned vector; callers promote it.
    pub(crate) fn split_off_half(&mut self) -> Vec<Branch<K, A>> {
        let mid = self.branches.len() / 2;
        self.branches.split_off(mid)
    }
}

impl<K, V, A: Address> LeafTier<K, V, A> {
    pub(crate) fn new(address: A, next: A) -> Self {
        LeafTier {
            address,
            next,
            buckets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner(pivots: &[Option<u32>]) -> InnerTier<u32, u64> {
        let mut t = InnerTier::new(1, ChildType::Leaf);
        for (i, p) in pivots.iter().enumerate() {
            t.branches.push(Branch {
                pivot: *p,
                address: 10 + i as u64,
            });
        }
        t
    }

    #[test]
    fn test_tier_inner_find() {
        let t = inner(&[None, Some(10), Some(20), Some(30)]);
        assert_eq!(t.find(&0), 0);
        assert_eq!(t.find(&9), 0);
        assert_eq!(t.find(&10), 1);
        assert_eq!(t.find(&15), 1);
        assert_eq!(t.find(&30), 3);
        assert_eq!(t.find(&u32::MAX), 3);
    }

    #[test]
    fn test_tier_remove_first_branch_promotes_pivot() {
        let mut t = inner(&[None, Some(10), Some(20)]);
        let (b, promoted) = t.remove_branch(0);
        assert_eq!(b.address, 10);
        assert_eq!(promoted, Some(10));
        assert_eq!(t.branches[0].pivot, None);
        assert_eq!(t.branches[1].pivot, Some(20));

        let (_, promoted) = t.remove_branch(1);
        assert_eq!(promoted, None);
        assert_eq!(t.branches.len(), 1);
    }

    #[test]
    fn test_tier_split_off_half() {
        let mut t = inner(&[None, Some(10), Some(20), Some(30), Some(40)]);
        let right = t.split_off_half();
        assert_eq!(t.branches.len(), 2);
        assert_eq!(right.len(), 3);
        assert_eq!(right[0].pivot, Some(20));
    }

    #[test]
    fn test_tier_accessors() {
        let mut tier: Tier<u32, u32, u64> = Tier::Leaf(LeafTier::new(3, 0));
        assert!(tier.is_empty());
        assert_eq!(tier.kind(), TierKind::Leaf);
        assert!(tier.inner().is_err());
        tier.leaf_mut().unwrap().buckets.push(Bucket {
            key: Some(1),
            value: 1,
        });
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.address(), 3);
    }
}
