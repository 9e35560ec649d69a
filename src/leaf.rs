//! Changes made at the leaf a mutation lands on.
//!
//! Runs of equal keys that do not fit in one leaf continue in chain leaves.
//! A chain leaf follows its head through `next`, holds nothing but the
//! shared key, and has no branch of its own, so the head's last key equals
//! the chain leaf's first key. No other pair of neighbouring leaves can
//! share a key, which is how a chain is recognised.

use std::fmt::Debug;

use tracing::trace;

use crate::error::{Result, StrataError};
use crate::mutation::{Intent, Mutation};
use crate::storage::Storage;
use crate::tier::{Branch, Bucket, ChildType, LeafTier, Tier, TierKind, WriteGuard};
use crate::tree::Shared;

/// What a removal at the leaf came to.
pub(crate) enum Removal {
    Done(bool),
    /// The leaf emptied out as an only child and the leaf to its left was
    /// not located on the way down.
    Retry,
}

type Buckets<K, V> = Vec<Bucket<K, V>>;

impl<K, V, S> Shared<K, V, S>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    fn first_key(&self, leaf: &LeafTier<K, V, S::Address>) -> Option<K> {
        leaf.buckets.first().map(|b| self.keys.key(b).into_owned())
    }

    fn last_key(&self, leaf: &LeafTier<K, V, S::Address>) -> Option<K> {
        leaf.buckets.last().map(|b| self.keys.key(b).into_owned())
    }

    /// Insert keeping key order, after any values with an equal key.
    fn insert_sorted(&self, buckets: &mut Buckets<K, V>, bucket: Bucket<K, V>) {
        let pos = {
            let key = self.keys.key(&bucket);
            buckets.partition_point(|b| *self.keys.key(b) <= *key)
        };
        buckets.insert(pos, bucket);
    }

    /// Take a write lock on the leaf at `address` for the leaf level, unless
    /// the mutation already holds it.
    fn hold_leaf(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        li: usize,
        address: S::Address,
    ) -> Result<()> {
        if m.holds(address) {
            return Ok(());
        }
        let tier = self.pool.get(address)?;
        m.levels[li].lock(address, &tier);
        Ok(())
    }

    /// The chain leaf following `address`, if there is one. Locks the next
    /// leaf to find out.
    fn chain_next(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        li: usize,
        address: S::Address,
    ) -> Result<Option<S::Address>> {
        let (next, last) = {
            let leaf = m.tier(address)?.leaf()?;
            (leaf.next, self.last_key(leaf))
        };
        let last = match last {
            Some(last) if !self.storage.is_null(next) => last,
            _ => return Ok(None),
        };
        self.hold_leaf(m, li, next)?;
        let first = self.first_key(m.tier(next)?.leaf()?);
        Ok(if first.as_ref() == Some(&last) {
            Some(next)
        } else {
            None
        })
    }

    /// True if `key` lies beyond the last key of `leaf` and a chain of that
    /// last key follows it. Peeks at the next leaf with a read lock, which
    /// is released before returning.
    pub(crate) fn past_chain(&self, leaf: &LeafTier<K, V, S::Address>, key: &K) -> Result<bool> {
        let last = match self.last_key(leaf) {
            Some(last) if *key > last && !self.storage.is_null(leaf.next) => last,
            _ => return Ok(false),
        };
        let next = self.pool.get(leaf.next)?.read_arc();
        Ok(self.first_key(next.leaf()?).as_ref() == Some(&last))
    }

    fn create_leaf(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        next: S::Address,
        buckets: Buckets<K, V>,
    ) -> Result<S::Address> {
        let address = self.storage.allocate(TierKind::Leaf, self.leaf_capacity)?;
        let tier = Tier::Leaf(LeafTier {
            address,
            next,
            buckets,
        });
        m.created.push(self.pool.create(tier));
        Ok(address)
    }

    fn insert_branch(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        parent: S::Address,
        idx: usize,
        pivot: K,
        address: S::Address,
    ) -> Result<()> {
        m.tier_mut(parent)?.inner_mut()?.branches.insert(
            idx,
            Branch {
                pivot: Some(pivot),
                address,
            },
        );
        m.touch(parent);
        Ok(())
    }

    /// Add a value to the chain ending at `tail`.
    fn append_chain(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        tail: S::Address,
        bucket: Bucket<K, V>,
    ) -> Result<()> {
        let leaf = m.tier_mut(tail)?.leaf_mut()?;
        if leaf.buckets.len() < self.leaf_capacity {
            leaf.buckets.push(bucket);
            m.touch(tail);
            return Ok(());
        }
        let next = leaf.next;
        let extra = self.create_leaf(m, next, vec![bucket])?;
        m.tier_mut(tail)?.leaf_mut()?.next = extra;
        m.touch(tail);
        trace!(?tail, ?extra, "extend chain");
        Ok(())
    }

    /// Start a new indexed leaf for a key greater than everything in `after`
    /// and its subtree position.
    fn append_indexed(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        parent: S::Address,
        idx: usize,
        after: S::Address,
        key: K,
        bucket: Bucket<K, V>,
    ) -> Result<()> {
        let next = m.tier(after)?.leaf()?.next;
        let leaf = self.create_leaf(m, next, vec![bucket])?;
        m.tier_mut(after)?.leaf_mut()?.next = leaf;
        m.touch(after);
        self.insert_branch(m, parent, idx + 1, key, leaf)?;
        trace!(?after, ?leaf, "new leaf");
        Ok(())
    }

    pub(crate) fn leaf_insert(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        li: usize,
        parent: S::Address,
        address: S::Address,
        idx: usize,
    ) -> Result<()> {
        let key = m.key.clone();
        let value = match &mut m.intent {
            Intent::Insert(value) => value
                .take()
                .ok_or_else(|| StrataError::corrupt("value inserted twice"))?,
            Intent::Remove(_) => return Err(StrataError::corrupt("removal reached leaf insert")),
        };
        let bucket = self.keys.bucket(key.clone(), value);

        let (len, first, last) = {
            let leaf = m.tier(address)?.leaf()?;
            (leaf.buckets.len(), self.first_key(leaf), self.last_key(leaf))
        };

        if let Some(last) = last.as_ref().filter(|last| key >= **last) {
            if self.chain_next(m, li, address)?.is_some() {
                let mut tail = address;
                while let Some(next) = self.chain_next(m, li, tail)? {
                    tail = next;
                }
                return if key == *last {
                    self.append_chain(m, tail, bucket)
                } else {
                    self.append_indexed(m, parent, idx, tail, key, bucket)
                };
            }
        }

        if len < self.leaf_capacity {
            let leaf = m.tier_mut(address)?.leaf_mut()?;
            self.insert_sorted(&mut leaf.buckets, bucket);
            m.touch(address);
            return Ok(());
        }

        let (first, last) = match (first, last) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(StrataError::corrupt("full leaf without keys")),
        };
        if first == last {
            if key == first {
                return self.append_chain(m, address, bucket);
            }
            if key > first {
                return self.append_indexed(m, parent, idx, address, key, bucket);
            }
            // Everything moves right, the new key keeps this leaf and its
            // position in the parent.
            let leaf = m.tier_mut(address)?.leaf_mut()?;
            let moved = std::mem::replace(&mut leaf.buckets, vec![bucket]);
            let next = leaf.next;
            let right = self.create_leaf(m, next, moved)?;
            m.tier_mut(address)?.leaf_mut()?.next = right;
            m.touch(address);
            self.insert_branch(m, parent, idx + 1, first, right)?;
            trace!(leaf = ?address, ?right, "displace uniform leaf");
            return Ok(());
        }

        let leaf = m.tier_mut(address)?.leaf_mut()?;
        let at = self.split_point(&leaf.buckets)?;
        let mut moved = leaf.buckets.split_off(at);
        let next = leaf.next;
        let pivot = self.keys.key(&moved[0]).into_owned();
        if key >= pivot {
            self.insert_sorted(&mut moved, bucket);
        } else {
            self.insert_sorted(&mut leaf.buckets, bucket);
        }
        let right = self.create_leaf(m, next, moved)?;
        m.tier_mut(address)?.leaf_mut()?.next = right;
        m.touch(address);
        self.insert_branch(m, parent, idx + 1, pivot, right)?;
        trace!(leaf = ?address, ?right, at, "split leaf");
        Ok(())
    }

    /// The key boundary closest to the middle of `buckets`. A run of equal
    /// keys is never divided.
    fn split_point(&self, buckets: &Buckets<K, V>) -> Result<usize> {
        let len = buckets.len();
        let mid = len / 2;
        let boundary = |i: usize| -> bool {
            i > 0 && i < len && self.keys.key(&buckets[i - 1]) != self.keys.key(&buckets[i])
        };
        for distance in 0..=mid.max(len - mid) {
            if mid >= distance && boundary(mid - distance) {
                return Ok(mid - distance);
            }
            if boundary(mid + distance) {
                return Ok(mid + distance);
            }
        }
        Err(StrataError::corrupt("no key boundary in a mixed leaf"))
    }

    pub(crate) fn leaf_remove(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        li: usize,
        parent: S::Address,
        address: S::Address,
        idx: usize,
    ) -> Result<Removal> {
        let key = m.key.clone();
        let deletable = match m.intent {
            Intent::Remove(f) => f,
            Intent::Insert(_) => return Err(StrataError::corrupt("insert reached leaf remove")),
        };

        let (pos, len, last) = {
            let leaf = m.tier(address)?.leaf()?;
            let pos = leaf
                .buckets
                .iter()
                .position(|b| *self.keys.key(b) == key && deletable(&b.value));
            (pos, leaf.buckets.len(), self.last_key(leaf))
        };
        let pos = match pos {
            Some(pos) => pos,
            None if last.as_ref() == Some(&key) => {
                return self.chain_remove(m, li, address, deletable).map(Removal::Done)
            }
            None => return Ok(Removal::Done(false)),
        };

        if len > 1 {
            let removed = m.tier_mut(address)?.leaf_mut()?.buckets.remove(pos);
            m.removed = Some(removed.value);
            m.touch(address);
            if pos == len - 1 {
                self.refill_chain_head(m, li, address, &key)?;
            }
            if pos == 0 {
                let first = self.first_key(m.tier(address)?.leaf()?);
                if first.as_ref() != Some(&key) {
                    m.replacement = first;
                }
            }
            self.merge_leaves(m, li, parent, address, idx)?;
            return Ok(Removal::Done(true));
        }

        // The leaf is about to empty. A chain behind it moves in.
        if let Some(follower) = self.chain_next(m, li, address)? {
            let (buckets, next) = {
                let chained = m.tier_mut(follower)?.leaf_mut()?;
                (std::mem::take(&mut chained.buckets), chained.next)
            };
            let leaf = m.tier_mut(address)?.leaf_mut()?;
            let removed = std::mem::replace(&mut leaf.buckets, buckets);
            leaf.next = next;
            m.removed = removed.into_iter().next().map(|b| b.value);
            m.touch(address);
            m.free(follower);
            return Ok(Removal::Done(true));
        }

        // The last leaf of the tree stays, empty.
        if m.sole {
            let removed = m.tier_mut(address)?.leaf_mut()?.buckets.remove(pos);
            m.removed = Some(removed.value);
            m.touch(address);
            return Ok(Removal::Done(true));
        }

        let siblings = m.tier(parent)?.inner()?.branches.len();
        if siblings == 1 && !m.leftmost && m.left_leaf.is_none() {
            trace!(leaf = ?address, "left leaf of only child unknown");
            return Ok(Removal::Retry);
        }

        let removed = m.tier_mut(address)?.leaf_mut()?.buckets.remove(pos);
        m.removed = Some(removed.value);

        if idx + 1 < siblings {
            // Pull the right sibling into the emptied leaf.
            let right = m.tier(parent)?.inner()?.address_at(idx + 1)?;
            let next = m.tier(address)?.leaf()?.next;
            if next != right {
                return Err(StrataError::corrupt(format!(
                    "right sibling {:?} of {:?} not reachable",
                    right, address
                )));
            }
            self.hold_leaf(m, li, right)?;
            let (buckets, after) = {
                let r = m.tier_mut(right)?.leaf_mut()?;
                (std::mem::take(&mut r.buckets), r.next)
            };
            let leaf = m.tier_mut(address)?.leaf_mut()?;
            leaf.buckets = buckets;
            leaf.next = after;
            m.replacement = self.first_key(m.tier(address)?.leaf()?);
            m.tier_mut(parent)?.inner_mut()?.remove_branch(idx + 1);
            m.touch(address);
            m.touch(parent);
            m.free(right);
            trace!(leaf = ?address, ?right, "absorb right leaf");
            return Ok(Removal::Done(true));
        }

        // Last child of the parent: unlink it from the leaf to its left.
        let next = m.tier(address)?.leaf()?.next;
        match m.left_leaf.as_mut() {
            Some(left) => {
                let left_address = left.address();
                let left_leaf = left.leaf_mut()?;
                if left_leaf.next != address {
                    return Err(StrataError::corrupt(format!(
                        "left leaf {:?} does not lead to {:?}",
                        left_address, address
                    )));
                }
                left_leaf.next = next;
                m.touch(left_address);
            }
            None if m.leftmost => {}
            None => {
                return Err(StrataError::corrupt(format!(
                    "left leaf of {:?} was not located",
                    address
                )))
            }
        }
        m.tier_mut(parent)?.inner_mut()?.remove_branch(idx);
        m.touch(parent);
        m.free(address);
        trace!(leaf = ?address, "unlink empty leaf");
        Ok(Removal::Done(true))
    }

    /// Remove from the chain leaves following `head`.
    fn chain_remove(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        li: usize,
        head: S::Address,
        deletable: &dyn Fn(&V) -> bool,
    ) -> Result<bool> {
        let key = m.key.clone();
        let mut prev = head;
        while let Some(current) = self.chain_next(m, li, prev)? {
            let pos = m
                .tier(current)?
                .leaf()?
                .buckets
                .iter()
                .position(|b| *self.keys.key(b) == key && deletable(&b.value));
            if let Some(pos) = pos {
                let leaf = m.tier_mut(current)?.leaf_mut()?;
                let removed = leaf.buckets.remove(pos);
                let (emptied, next) = (leaf.buckets.is_empty(), leaf.next);
                m.removed = Some(removed.value);
                if emptied {
                    m.tier_mut(prev)?.leaf_mut()?.next = next;
                    m.touch(prev);
                    m.free(current);
                    trace!(chain = ?current, "unlink empty chain leaf");
                } else {
                    m.touch(current);
                }
                return Ok(true);
            }
            prev = current;
        }
        Ok(false)
    }

    /// After the last bucket of `address` was removed, keep the head of a
    /// following chain ending in the chain's key.
    fn refill_chain_head(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        li: usize,
        address: S::Address,
        key: &K,
    ) -> Result<()> {
        let (next, last) = {
            let leaf = m.tier(address)?.leaf()?;
            (leaf.next, self.last_key(leaf))
        };
        if last.as_ref() == Some(key) || self.storage.is_null(next) {
            return Ok(());
        }
        self.hold_leaf(m, li, next)?;
        let follower = m.tier_mut(next)?.leaf_mut()?;
        let starts_chain = follower
            .buckets
            .first()
            .map(|b| *self.keys.key(b) == *key)
            .unwrap_or(false);
        if !starts_chain {
            return Ok(());
        }
        let bucket = follower.buckets.remove(0);
        let (emptied, after) = (follower.buckets.is_empty(), follower.next);
        let leaf = m.tier_mut(address)?.leaf_mut()?;
        leaf.buckets.push(bucket);
        if emptied {
            leaf.next = after;
            m.free(next);
        } else {
            m.touch(next);
        }
        Ok(())
    }

    /// Merge `address` with a neighbour under the same parent when the two
    /// fit in one leaf. The right neighbour is only locked when it directly
    /// follows in the leaf list, so a chain in between is never passed over.
    fn merge_leaves(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        li: usize,
        parent: S::Address,
        address: S::Address,
        idx: usize,
    ) -> Result<()> {
        if !m.holds(parent) || m.tier_mut(parent).is_err() {
            return Ok(());
        }
        let (branches, right, left) = {
            let p = m.tier(parent)?.inner()?;
            let right = p.branches.get(idx + 1).map(|b| b.address);
            let left = idx.checked_sub(1).map(|i| p.branches[i].address);
            (p.branches.len(), right, left)
        };
        debug_assert!(idx < branches);
        let (len, next) = {
            let leaf = m.tier(address)?.leaf()?;
            (leaf.buckets.len(), leaf.next)
        };

        if let Some(right) = right.filter(|r| *r == next) {
            self.hold_leaf(m, li, right)?;
            if len + m.tier(right)?.len() <= self.leaf_capacity {
                let (buckets, after) = {
                    let r = m.tier_mut(right)?.leaf_mut()?;
                    (std::mem::take(&mut r.buckets), r.next)
                };
                let leaf = m.tier_mut(address)?.leaf_mut()?;
                leaf.buckets.extend(buckets);
                leaf.next = after;
                m.tier_mut(parent)?.inner_mut()?.remove_branch(idx + 1);
                m.touch(parent);
                m.free(right);
                trace!(leaf = ?address, ?right, "merge right leaf");
                return Ok(());
            }
        }

        let left_fits = match (left, m.left_leaf.as_ref()) {
            (Some(left), Some(g)) => {
                g.address() == left
                    && g.leaf()?.next == address
                    && g.len() + len <= self.leaf_capacity
            }
            _ => false,
        };
        if left_fits {
            let (buckets, after) = {
                let leaf = m.tier_mut(address)?.leaf_mut()?;
                (std::mem::take(&mut leaf.buckets), leaf.next)
            };
            if let Some(g) = m.left_leaf.as_mut() {
                let left_address = g.address();
                let left_leaf = g.leaf_mut()?;
                left_leaf.buckets.extend(buckets);
                left_leaf.next = after;
                m.touch(left_address);
            }
            m.tier_mut(parent)?.inner_mut()?.remove_branch(idx);
            m.touch(parent);
            m.free(address);
            trace!(leaf = ?address, "merge into left leaf");
        }
        Ok(())
    }

    /// Find and write lock the leaf immediately left of the subtree behind
    /// branch `idx` of the inner tier at `from`.
    pub(crate) fn locate_left_leaf(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        from: S::Address,
        idx: usize,
    ) -> Result<()> {
        m.left_leaf = None;
        let (mut address, mut child_type) = {
            let tier = m.tier(from)?.inner()?;
            (tier.address_at(idx - 1)?, tier.child_type)
        };
        let mut coupled = None;
        while child_type == ChildType::Inner {
            // The first tier may be a sibling the descent already holds.
            if coupled.is_none() && m.holds(address) {
                let tier = m.tier(address)?.inner()?;
                address = tier.address_at(tier.branches.len().saturating_sub(1))?;
                child_type = tier.child_type;
                continue;
            }
            let guard = self.pool.get(address)?.read_arc();
            let (next, next_type) = {
                let tier = guard.inner()?;
                (tier.address_at(tier.branches.len().saturating_sub(1))?, tier.child_type)
            };
            address = next;
            child_type = next_type;
            coupled = Some(guard);
        }
        let mut leaf: WriteGuard<K, V, S::Address> = self.pool.get(address)?.write_arc();
        std::mem::drop(coupled);
        loop {
            let (next, last) = {
                let l = leaf.leaf()?;
                (l.next, self.last_key(l))
            };
            let last = match last {
                Some(last) if !self.storage.is_null(next) => last,
                _ => break,
            };
            let candidate = self.pool.get(next)?.write_arc();
            let first = self.first_key(candidate.leaf()?);
            if first.as_ref() != Some(&last) {
                break;
            }
            leaf = candidate;
        }
        trace!(?from, idx, left = ?leaf.address(), "located left leaf");
        m.left_leaf = Some(leaf);
        Ok(())
    }
}
