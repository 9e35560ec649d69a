//! The tree handle and the state its clones share.

use std::fmt::Debug;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cursor::Cursor;
use crate::error::{Result, StrataError};
use crate::mutation::Mutation;
use crate::pool::TierPool;
use crate::schema::{Keys, Schema};
use crate::storage::Storage;
use crate::tier::{Branch, ChildType, InnerTier, LeafTier, ReadGuard, Tier, TierKind};
use crate::writer::TierWriter;

pub(crate) struct Shared<K, V, S>
where
    S: Storage<K, V>,
{
    pub(crate) root: S::Address,
    pub(crate) inner_capacity: usize,
    pub(crate) leaf_capacity: usize,
    pub(crate) keys: Keys<K, V>,
    pub(crate) storage: Arc<S>,
    pub(crate) pool: TierPool<K, V, S>,
    pub(crate) writer: TierWriter<K, V, S>,
}

/// A concurrent B+tree of values ordered by an extracted key.
///
/// The handle is cheap to clone and every clone works on the same tree.
/// Any number of threads may insert, remove and read at once. Values with
/// equal keys are all kept, in insertion order.
pub struct Strata<K, V, S>
where
    S: Storage<K, V>,
{
    shared: Arc<Shared<K, V, S>>,
}

impl<K, V, S> Clone for Strata<K, V, S>
where
    S: Storage<K, V>,
{
    fn clone(&self) -> Self {
        Strata {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V, S> Strata<K, V, S>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    pub(crate) fn create(schema: Schema<K, V>, storage: S) -> Result<Self> {
        let storage = Arc::new(storage);
        let root = storage.allocate(TierKind::Inner, schema.inner_capacity)?;
        let leaf = storage.allocate(TierKind::Leaf, schema.leaf_capacity)?;
        let mut tier = InnerTier::new(root, ChildType::Leaf);
        tier.branches.push(Branch {
            pivot: None,
            address: leaf,
        });
        storage.write(&Tier::Leaf(LeafTier::new(leaf, storage.null())))?;
        storage.write(&Tier::Inner(tier))?;
        debug!(?root, "created tree");
        Ok(Self::build(schema, storage, root))
    }

    pub(crate) fn open(schema: Schema<K, V>, storage: S, root: S::Address) -> Result<Self> {
        if let Tier::Leaf(_) = storage.load(root)? {
            return Err(StrataError::corrupt(format!(
                "root {:?} is a leaf",
                root
            )));
        }
        debug!(?root, "opened tree");
        Ok(Self::build(schema, Arc::new(storage), root))
    }

    fn build(schema: Schema<K, V>, storage: Arc<S>, root: S::Address) -> Self {
        Strata {
            shared: Arc::new(Shared {
                root,
                inner_capacity: schema.inner_capacity,
                leaf_capacity: schema.leaf_capacity,
                keys: Keys::new(schema.extractor, schema.cache_fields),
                pool: TierPool::new(storage.clone(), schema.pool_policy),
                writer: TierWriter::new(storage.clone(), schema.write_policy),
                storage,
            }),
        }
    }

    /// Address of the root tier, which never changes. Pass it to
    /// [`Schema::open`] to attach to the tree again later.
    pub fn root(&self) -> S::Address {
        self.shared.root
    }

    /// The storage the tree lives in.
    pub fn storage(&self) -> &S {
        &self.shared.storage
    }

    /// Insert `value` under the key extracted from it. Values with a key
    /// already present go after the existing ones.
    pub fn add(&self, value: V) -> Result<()> {
        let key = self.shared.keys.extract(&value);
        trace!(?key, "add");
        let mut m = Mutation::insert(key, value, self.shared.writer.begin());
        let done = self.shared.mutate(&mut m);
        let ended = self.shared.writer.end(m.into_session());
        done.and(ended)
    }

    /// Remove the first value stored under `key`.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.remove_if(key, |_| true)
    }

    /// Remove the first value stored under `key` that `deletable` accepts.
    /// Returns the removed value, or `None` when nothing matched.
    pub fn remove_if<F>(&self, key: &K, deletable: F) -> Result<Option<V>>
    where
        F: Fn(&V) -> bool,
    {
        trace!(?key, "remove");
        let mut m = Mutation::remove(key.clone(), &deletable, self.shared.writer.begin());
        let done = self.shared.mutate(&mut m);
        let removed = m.removed.take();
        let ended = self.shared.writer.end(m.into_session());
        done.and(ended)?;
        Ok(removed)
    }

    /// A cursor over the values stored under `key`, in insertion order.
    pub fn find(&self, key: &K) -> Result<Cursor<K, V, S>> {
        let leaf = self.shared.leaf_for(Some(key))?;
        let index = self.shared.lower_bound(&leaf, key)?;
        Cursor::new(self.shared.clone(), leaf, index, Some(key.clone()))
    }

    /// A cursor over every value from the first with a key not less than
    /// `key` to the end of the tree.
    pub fn seek(&self, key: &K) -> Result<Cursor<K, V, S>> {
        let leaf = self.shared.leaf_for(Some(key))?;
        let index = self.shared.lower_bound(&leaf, key)?;
        Cursor::new(self.shared.clone(), leaf, index, None)
    }

    /// A cursor over every value in the tree.
    pub fn first(&self) -> Result<Cursor<K, V, S>> {
        let leaf = self.shared.leaf_for(None)?;
        Cursor::new(self.shared.clone(), leaf, 0, None)
    }

    /// Number of inner tiers between the root and the leaves, counting the
    /// root.
    pub fn depth(&self) -> Result<usize> {
        let mut depth = 0;
        let mut guard = self.shared.pool.get(self.shared.root)?.read_arc();
        loop {
            let next = match &*guard {
                Tier::Inner(tier) => tier.address_at(0)?,
                Tier::Leaf(_) => return Ok(depth),
            };
            depth += 1;
            guard = self.shared.pool.get(next)?.read_arc();
        }
    }

    /// Write out everything the write policy has staged.
    pub fn flush(&self) -> Result<()> {
        self.shared.writer.flush()
    }

    /// Free every tier of the tree, children before their parent. Other
    /// clones of the handle must not be used afterwards.
    pub fn destroy(self) -> Result<()> {
        let shared = &self.shared;
        shared.writer.flush()?;
        let mut freed = Vec::new();
        shared.collect(shared.root, &mut freed)?;
        for address in freed.iter() {
            shared.pool.forget(*address);
            shared.storage.free(*address)?;
        }
        debug!(tiers = freed.len(), "destroyed tree");
        Ok(())
    }

    /// Check the structure of the tree. Meant for quiescent trees in tests;
    /// returns a `Corrupt` error naming the first problem found.
    pub fn copacetic(&self) -> Result<()> {
        let shared = &self.shared;
        let mut audit = Audit {
            leaves: Vec::new(),
            pivots: Vec::new(),
            leaf_depth: None,
        };
        let root = shared.pool.get(shared.root)?.read_arc();
        root.inner()?;
        shared.audit(&root, 0, None, None, &mut audit)?;
        shared.audit_leaves(&audit.leaves)
    }
}

struct Audit<K, A> {
    leaves: Vec<A>,
    pivots: Vec<K>,
    leaf_depth: Option<usize>,
}

impl<K, V, S> Shared<K, V, S>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    /// Gather the subtree at `address` in post order. A leaf is followed by
    /// the chain leaves behind it, which no branch leads to.
    fn collect(&self, address: S::Address, out: &mut Vec<S::Address>) -> Result<()> {
        let guard = self.pool.get(address)?.read_arc();
        match &*guard {
            Tier::Inner(inner) => {
                for branch in inner.branches.iter() {
                    self.collect(branch.address, out)?;
                }
            }
            Tier::Leaf(leaf) => {
                let mut last = leaf.buckets.last().map(|b| self.keys.key(b).into_owned());
                let mut next = leaf.next;
                while let Some(key) = last.filter(|_| !self.storage.is_null(next)) {
                    let chained = self.pool.get(next)?.read_arc();
                    let tier = chained.leaf()?;
                    if tier.buckets.first().map(|b| *self.keys.key(b) != key).unwrap_or(true) {
                        break;
                    }
                    out.push(next);
                    last = Some(key);
                    next = tier.next;
                }
            }
        }
        out.push(address);
        Ok(())
    }

    /// Read-couple down to the leaf holding `key`, or the leftmost leaf.
    pub(crate) fn leaf_for(&self, key: Option<&K>) -> Result<ReadGuard<K, V, S::Address>> {
        let mut guard = self.pool.get(self.root)?.read_arc();
        loop {
            let next = match &*guard {
                Tier::Inner(tier) => tier.address_at(key.map(|k| tier.find(k)).unwrap_or(0))?,
                Tier::Leaf(_) => return Ok(guard),
            };
            guard = self.pool.get(next)?.read_arc();
        }
    }

    pub(crate) fn lower_bound(
        &self,
        leaf: &ReadGuard<K, V, S::Address>,
        key: &K,
    ) -> Result<usize> {
        let leaf = leaf.leaf()?;
        Ok(leaf
            .buckets
            .partition_point(|b| *self.keys.key(b) < *key))
    }

    /// Check the subtree at `tier`, whose keys must lie in `[lo, hi)`.
    /// Returns the smallest key in the subtree.
    fn audit(
        &self,
        tier: &Tier<K, V, S::Address>,
        depth: usize,
        lo: Option<&K>,
        hi: Option<&K>,
        audit: &mut Audit<K, S::Address>,
    ) -> Result<Option<K>> {
        let address = tier.address();
        match tier {
            Tier::Leaf(leaf) => {
                if *audit.leaf_depth.get_or_insert(depth) != depth {
                    return Err(StrataError::corrupt(format!(
                        "leaf {:?} at depth {} in an unbalanced tree",
                        address, depth
                    )));
                }
                if leaf.buckets.len() > self.leaf_capacity {
                    return Err(StrataError::corrupt(format!("leaf {:?} over capacity", address)));
                }
                let keys: Vec<K> = leaf
                    .buckets
                    .iter()
                    .map(|b| self.keys.key(b).into_owned())
                    .collect();
                if keys.windows(2).any(|w| w[0] > w[1]) {
                    return Err(StrataError::corrupt(format!("leaf {:?} out of order", address)));
                }
                let below = lo.zip(keys.first()).map(|(lo, k)| k < lo).unwrap_or(false);
                let above = hi.zip(keys.last()).map(|(hi, k)| k >= hi).unwrap_or(false);
                if below || above {
                    return Err(StrataError::corrupt(format!(
                        "leaf {:?} holds keys outside its branch",
                        address
                    )));
                }
                audit.leaves.push(address);
                Ok(keys.into_iter().next())
            }
            Tier::Inner(inner) => {
                if inner.branches.is_empty() || inner.branches.len() > self.inner_capacity {
                    return Err(StrataError::corrupt(format!(
                        "inner tier {:?} has {} branches",
                        address,
                        inner.branches.len()
                    )));
                }
                if inner.branches[0].pivot.is_some() {
                    return Err(StrataError::corrupt(format!(
                        "first branch of {:?} has a pivot",
                        address
                    )));
                }
                let mut leftmost = None;
                for (i, branch) in inner.branches.iter().enumerate() {
                    let pivot = match (i, branch.pivot.as_ref()) {
                        (0, _) => lo,
                        (_, Some(pivot)) => Some(pivot),
                        (_, None) => {
                            return Err(StrataError::corrupt(format!(
                                "branch {} of {:?} has no pivot",
                                i, address
                            )))
                        }
                    };
                    if i > 0 {
                        if let Some(pivot) = branch.pivot.as_ref() {
                            if audit.pivots.last().map(|p| p >= pivot).unwrap_or(false) {
                                return Err(StrataError::corrupt(format!(
                                    "pivot {:?} of {:?} is out of order or repeated",
                                    pivot, address
                                )));
                            }
                            audit.pivots.push(pivot.clone());
                        }
                    }
                    let bound = inner
                        .branches
                        .get(i + 1)
                        .and_then(|b| b.pivot.as_ref())
                        .or(hi);
                    let child = self.pool.get(branch.address)?.read_arc();
                    let kind_matches = match (inner.child_type, &*child) {
                        (ChildType::Inner, Tier::Inner(_)) | (ChildType::Leaf, Tier::Leaf(_)) => true,
                        _ => false,
                    };
                    if !kind_matches {
                        return Err(StrataError::corrupt(format!(
                            "child {:?} of {:?} is not of the declared type",
                            branch.address, address
                        )));
                    }
                    let first = self.audit(&child, depth + 1, pivot, bound, audit)?;
                    if i > 0 && first.as_ref() != branch.pivot.as_ref() {
                        return Err(StrataError::corrupt(format!(
                            "pivot {:?} of {:?} is not the first key below it",
                            branch.pivot, address
                        )));
                    }
                    if i == 0 {
                        leftmost = first;
                    }
                }
                Ok(leftmost)
            }
        }
    }

    /// Walk the leaf list and check it visits the indexed leaves in order,
    /// with only well formed chain leaves in between.
    fn audit_leaves(&self, leaves: &[S::Address]) -> Result<()> {
        let mut at = 0;
        let mut current = match leaves.first() {
            Some(first) => self.pool.get(*first)?.read_arc(),
            None => return Err(StrataError::corrupt("tree has no leaves")),
        };
        loop {
            let (next, last, empty) = {
                let leaf = current.leaf()?;
                let last = leaf.buckets.last().map(|b| self.keys.key(b).into_owned());
                (leaf.next, last, leaf.buckets.is_empty())
            };
            if empty && leaves.len() > 1 {
                return Err(StrataError::corrupt(format!(
                    "empty leaf {:?} in a tree of {} leaves",
                    current.address(),
                    leaves.len()
                )));
            }
            if self.storage.is_null(next) {
                break;
            }
            let following = self.pool.get(next)?.read_arc();
            let leaf = following.leaf()?;
            let keys: Vec<K> = leaf
                .buckets
                .iter()
                .map(|b| self.keys.key(b).into_owned())
                .collect();
            if leaves.get(at + 1) == Some(&next) {
                at += 1;
                if keys.first().zip(last.as_ref()).map(|(f, l)| f <= l).unwrap_or(false) {
                    return Err(StrataError::corrupt(format!(
                        "leaf {:?} does not follow its predecessor in key order",
                        next
                    )));
                }
            } else {
                let uniform = keys.iter().all(|k| Some(k) == last.as_ref());
                if keys.is_empty() || !uniform || keys.len() > self.leaf_capacity {
                    return Err(StrataError::corrupt(format!(
                        "leaf {:?} is neither indexed nor a chain leaf",
                        next
                    )));
                }
            }
            current = following;
        }
        if at + 1 != leaves.len() {
            return Err(StrataError::corrupt(format!(
                "leaf list reaches {} of {} indexed leaves",
                at + 1,
                leaves.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    type Tree<V> = Strata<u32, V, MemoryStorage<u32, V>>;

    fn tree(inner: usize, leaf: usize) -> Tree<u32> {
        let _ = tracing_subscriber::fmt::try_init();
        Schema::new(|v: &u32| *v)
            .inner_capacity(inner)
            .leaf_capacity(leaf)
            .create(MemoryStorage::new())
            .unwrap()
    }

    fn values<V: Clone + Send + Sync + 'static>(tree: &Tree<V>) -> Vec<V> {
        tree.first().unwrap().map(|v| v.unwrap()).collect()
    }

    #[test]
    fn test_strata_empty() {
        let tree = tree(5, 7);
        tree.copacetic().unwrap();
        assert_eq!(tree.depth().unwrap(), 1);
        assert!(!tree.first().unwrap().has_next());
        assert!(!tree.find(&3).unwrap().has_next());
        assert_eq!(tree.remove(&3).unwrap(), None);
        tree.copacetic().unwrap();
    }

    #[test]
    fn test_strata_ascending_split_and_drain() {
        let tree = tree(5, 7);
        for v in 1..=20 {
            tree.add(v).unwrap();
            tree.copacetic().unwrap();
        }
        assert_eq!(values(&tree), (1..=20).collect::<Vec<_>>());
        // The root split exactly once.
        assert_eq!(tree.depth().unwrap(), 2);
        for v in 1..=20 {
            let mut c = tree.find(&v).unwrap();
            assert_eq!(c.next_value().unwrap(), v);
            assert!(!c.has_next());
        }

        assert_eq!(tree.remove(&10).unwrap(), Some(10));
        tree.copacetic().unwrap();
        assert!(!tree.find(&10).unwrap().has_next());
        assert_eq!(
            values(&tree),
            (1..=20).filter(|v| *v != 10).collect::<Vec<_>>()
        );

        for v in (1..=20).filter(|v| *v != 10) {
            assert_eq!(tree.remove(&v).unwrap(), Some(v));
            tree.copacetic().unwrap();
            assert!(!tree.find(&v).unwrap().has_next());
        }
        assert!(values(&tree).is_empty());
    }

    #[test]
    fn test_strata_root_splits() {
        let tree = tree(3, 2);
        for v in 0..64 {
            tree.add(v).unwrap();
        }
        tree.copacetic().unwrap();
        assert!(tree.depth().unwrap() >= 3);
        for v in 0..64 {
            assert_eq!(tree.remove(&v).unwrap(), Some(v));
            tree.copacetic().unwrap();
        }
        assert!(values(&tree).is_empty());
    }

    #[test]
    fn test_strata_descending_and_interleaved() {
        let tree = tree(4, 3);
        for v in (0..50).rev() {
            tree.add(v * 2).unwrap();
        }
        for v in 0..50 {
            tree.add(v * 2 + 1).unwrap();
        }
        tree.copacetic().unwrap();
        assert_eq!(values(&tree), (0..100).collect::<Vec<_>>());

        // Remove from the middle out.
        for v in (0..100).filter(|v| v % 3 == 0) {
            assert_eq!(tree.remove(&v).unwrap(), Some(v));
        }
        tree.copacetic().unwrap();
        assert_eq!(
            values(&tree),
            (0..100).filter(|v| v % 3 != 0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_strata_duplicate_chain() {
        let _ = tracing_subscriber::fmt::try_init();
        let tree: Strata<char, (char, u32), _> = Schema::new(|v: &(char, u32)| v.0)
            .leaf_capacity(4)
            .inner_capacity(5)
            .create(MemoryStorage::new())
            .unwrap();
        assert_eq!(tree.storage().len(), 2);
        for i in 0..7 {
            tree.add(('a', i)).unwrap();
            tree.copacetic().unwrap();
        }
        let found: Vec<u32> = tree.find(&'a').unwrap().map(|v| v.unwrap().1).collect();
        assert_eq!(found, (0..7).collect::<Vec<_>>());
        // Four in the leaf, three in a chain leaf behind it, none indexed.
        assert_eq!(tree.storage().len(), 3);
        assert_eq!(tree.depth().unwrap(), 1);
        for i in 0..7 {
            assert_eq!(tree.remove(&'a').unwrap(), Some(('a', i)));
            tree.copacetic().unwrap();
        }
        assert_eq!(tree.storage().len(), 2);
        assert_eq!(tree.depth().unwrap(), 1);
        assert!(!tree.first().unwrap().has_next());

        for i in 0..7 {
            tree.add(('a', i)).unwrap();
        }

        // Keys on either side of the chain.
        tree.add(('b', 0)).unwrap();
        tree.add(('0', 0)).unwrap();
        tree.add(('a', 7)).unwrap();
        tree.copacetic().unwrap();
        let found: Vec<u32> = tree.find(&'a').unwrap().map(|v| v.unwrap().1).collect();
        assert_eq!(found, (0..8).collect::<Vec<_>>());
        let all: Vec<char> = tree.first().unwrap().map(|v| v.unwrap().0).collect();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], '0');
        assert_eq!(all[9], 'b');

        // Removal is first in, first out, and respects the predicate.
        assert_eq!(tree.remove(&'a').unwrap(), Some(('a', 0)));
        assert_eq!(tree.remove_if(&'a', |v| v.1 == 6).unwrap(), Some(('a', 6)));
        assert_eq!(tree.remove_if(&'a', |v| v.1 == 6).unwrap(), None);
        tree.copacetic().unwrap();
        let found: Vec<u32> = tree.find(&'a').unwrap().map(|v| v.unwrap().1).collect();
        assert_eq!(found, vec![1, 2, 3, 4, 5, 7]);

        while tree.remove(&'a').unwrap().is_some() {
            tree.copacetic().unwrap();
        }
        let all: Vec<char> = tree.first().unwrap().map(|v| v.unwrap().0).collect();
        assert_eq!(all, vec!['0', 'b']);
    }

    #[test]
    fn test_strata_uniform_leaf_displaced_by_smaller_key() {
        let tree = tree(5, 3);
        for _ in 0..3 {
            tree.add(10).unwrap();
        }
        tree.add(5).unwrap();
        tree.copacetic().unwrap();
        assert_eq!(values(&tree), vec![5, 10, 10, 10]);
        tree.add(10).unwrap();
        tree.add(20).unwrap();
        tree.copacetic().unwrap();
        assert_eq!(values(&tree), vec![5, 10, 10, 10, 10, 20]);
    }

    #[test]
    fn test_strata_cursor() {
        let tree = tree(5, 4);
        for v in 0..30 {
            tree.add(v * 10).unwrap();
        }
        let seek: Vec<u32> = tree.seek(&95).unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(seek, (10..30).map(|v| v * 10).collect::<Vec<_>>());

        let mut c = tree.find(&40).unwrap();
        assert!(c.has_next());
        assert_eq!(c.next_value().unwrap(), 40);
        assert!(!c.has_next());
        assert!(matches!(c.next_value(), Err(StrataError::IllegalState(_))));

        let mut c = tree.first().unwrap();
        assert_eq!(c.next_value().unwrap(), 0);
        c.release();
        c.release();
        assert!(!c.has_next());
        assert!(matches!(c.next_value(), Err(StrataError::IllegalState(_))));
        assert!(c.next().is_none());

        // A released cursor no longer blocks writers.
        tree.add(1).unwrap();
    }

    #[test]
    fn test_strata_reopen_and_destroy() {
        let tree = tree(4, 4);
        for v in 0..40 {
            tree.add(v).unwrap();
        }
        let root = tree.root();
        let snapshot = tree.storage().snapshot();
        std::mem::drop(tree);

        let tree = Schema::new(|v: &u32| *v)
            .inner_capacity(4)
            .leaf_capacity(4)
            .open(snapshot, root)
            .unwrap();
        tree.copacetic().unwrap();
        assert_eq!(values(&tree), (0..40).collect::<Vec<_>>());
        tree.add(40).unwrap();

        let handle = tree.clone();
        tree.destroy().unwrap();
        assert!(handle.storage().is_empty());
    }

    #[test]
    fn test_strata_destroy_frees_chains() {
        let tree = tree(3, 2);
        for v in 0..24 {
            tree.add(v / 4).unwrap();
        }
        tree.copacetic().unwrap();
        assert!(tree.depth().unwrap() >= 2);
        assert!(tree.storage().len() > 4);
        let handle = tree.clone();
        tree.destroy().unwrap();
        assert!(handle.storage().is_empty());
    }

    #[test]
    fn test_strata_open_rejects_leaf_root() {
        let storage: MemoryStorage<u32, u32> = MemoryStorage::new();
        let a = storage.allocate(TierKind::Leaf, 4).unwrap();
        storage
            .write(&Tier::Leaf(LeafTier::new(a, storage.null())))
            .unwrap();
        let r = Schema::new(|v: &u32| *v).open(storage, a);
        assert!(matches!(r, Err(StrataError::Corrupt(_))));
    }
}
