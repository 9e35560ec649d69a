//! Structural changes deferred during the descent and carried out once the
//! leaf has been changed. They run deepest level first, so a tier is always
//! finished with its own children before its parent looks at its size.

use std::fmt::Debug;

use tracing::trace;

use crate::error::{Result, StrataError};
use crate::mutation::Mutation;
use crate::storage::Storage;
use crate::tier::{Address, Branch, ChildType, InnerTier, Tier, TierKind};
use crate::tree::Shared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation<A> {
    /// Move the contents of the root into two new tiers under it.
    SplitRoot { root: A },
    /// Move the upper half of `child` into a new sibling.
    SplitInner { parent: A, child: A },
    /// Pull the children of the root up into it.
    MergeRoot { root: A },
    /// Fold `right` into `left` when they fit together.
    MergeInner { parent: A, left: A, right: A },
    /// Drop the branch to `child` if it ended up empty.
    RemoveEmpty { parent: A, child: A },
    /// Replace the removed key where it is used as a pivot in `tier`.
    Swap { tier: A },
}

impl<A> Operation<A> {
    /// Whether the operation can be dropped when the levels below turn out
    /// not to need it. A swap has to happen even when nothing merges.
    pub(crate) fn can_cancel(&self) -> bool {
        !matches!(self, Operation::Swap { .. })
    }
}

fn inner_of<K, V, A: Address>(tier: &mut Tier<K, V, A>) -> Result<&mut InnerTier<K, A>> {
    tier.inner_mut()
}

impl<K, V, S> Shared<K, V, S>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    pub(crate) fn execute(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        op: Operation<S::Address>,
    ) -> Result<()> {
        trace!(?op, "execute");
        match op {
            Operation::SplitRoot { root } => self.split_root(m, root),
            Operation::SplitInner { parent, child } => self.split_inner(m, parent, child),
            Operation::MergeRoot { root } => self.merge_root(m, root),
            Operation::MergeInner {
                parent,
                left,
                right,
            } => self.merge_inner(m, parent, left, right),
            Operation::RemoveEmpty { parent, child } => self.remove_empty(m, parent, child),
            Operation::Swap { tier } => self.swap(m, tier),
        }
    }

    fn split_root(&self, m: &mut Mutation<'_, K, V, S::Address>, root: S::Address) -> Result<()> {
        let (child_type, left_branches, mut right_branches) = {
            let tier = inner_of(m.tier_mut(root)?)?;
            if tier.branches.len() < self.inner_capacity {
                return Ok(());
            }
            let right = tier.split_off_half();
            let left = std::mem::take(&mut tier.branches);
            (tier.child_type, left, right)
        };
        let pivot = right_branches
            .first_mut()
            .and_then(|b| b.pivot.take())
            .ok_or_else(|| StrataError::corrupt("split root without a pivot"))?;

        let left = self.create_inner(m, child_type, left_branches)?;
        let right = self.create_inner(m, child_type, right_branches)?;

        let tier = inner_of(m.tier_mut(root)?)?;
        tier.child_type = ChildType::Inner;
        tier.branches = vec![
            Branch {
                pivot: None,
                address: left,
            },
            Branch {
                pivot: Some(pivot),
                address: right,
            },
        ];
        m.touch(root);
        trace!(?root, ?left, ?right, "split root");
        Ok(())
    }

    fn split_inner(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        parent: S::Address,
        child: S::Address,
    ) -> Result<()> {
        let (child_type, mut moved) = {
            let tier = inner_of(m.tier_mut(child)?)?;
            if tier.branches.len() < self.inner_capacity {
                return Ok(());
            }
            (tier.child_type, tier.split_off_half())
        };
        let pivot = moved
            .first_mut()
            .and_then(|b| b.pivot.take())
            .ok_or_else(|| StrataError::corrupt("split inner tier without a pivot"))?;
        let sibling = self.create_inner(m, child_type, moved)?;

        let tier = inner_of(m.tier_mut(parent)?)?;
        let idx = tier.index_of(child).ok_or_else(|| {
            StrataError::corrupt(format!("{:?} is not a child of {:?}", child, parent))
        })?;
        tier.branches.insert(
            idx + 1,
            Branch {
                pivot: Some(pivot),
                address: sibling,
            },
        );
        m.touch(child);
        m.touch(parent);
        trace!(?parent, ?child, ?sibling, "split inner");
        Ok(())
    }

    fn merge_root(&self, m: &mut Mutation<'_, K, V, S::Address>, root: S::Address) -> Result<()> {
        let children: Vec<(Option<K>, S::Address)> = {
            let tier = m.tier(root)?.inner()?;
            if tier.child_type != ChildType::Inner || tier.branches.len() > 2 {
                return Ok(());
            }
            tier.branches
                .iter()
                .map(|b| (b.pivot.clone(), b.address))
                .collect()
        };
        if children.iter().any(|(_, a)| !m.holds(*a)) {
            return Ok(());
        }
        let total: usize = children
            .iter()
            .map(|(_, a)| m.tier(*a).map(|t| t.len()))
            .sum::<Result<usize>>()?;
        if total > self.inner_capacity {
            return Ok(());
        }

        let mut branches = Vec::with_capacity(total);
        let mut child_type = ChildType::Leaf;
        for (pivot, address) in children.iter() {
            let tier = inner_of(m.tier_mut(*address)?)?;
            child_type = tier.child_type;
            let mut moved = std::mem::take(&mut tier.branches);
            if let Some(first) = moved.first_mut() {
                first.pivot = pivot.clone();
            }
            branches.extend(moved);
        }
        let tier = inner_of(m.tier_mut(root)?)?;
        tier.branches = branches;
        tier.child_type = child_type;
        m.touch(root);
        for (_, address) in children {
            m.free(address);
        }
        trace!(?root, "merge root");
        Ok(())
    }

    fn merge_inner(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        parent: S::Address,
        left: S::Address,
        right: S::Address,
    ) -> Result<()> {
        if !m.holds(left) || !m.holds(right) {
            return Ok(());
        }
        let size = m.tier(left)?.len() + m.tier(right)?.len();
        if size > self.inner_capacity {
            return Ok(());
        }
        let idx = {
            let tier = m.tier(parent)?.inner()?;
            match (tier.index_of(left), tier.index_of(right)) {
                (Some(l), Some(r)) if l + 1 == r => r,
                // One of them was dropped by an earlier operation.
                _ => return Ok(()),
            }
        };
        let (removed, _) = inner_of(m.tier_mut(parent)?)?.remove_branch(idx);
        let mut moved = std::mem::take(&mut inner_of(m.tier_mut(right)?)?.branches);
        if let Some(first) = moved.first_mut() {
            first.pivot = removed.pivot;
        }
        inner_of(m.tier_mut(left)?)?.branches.extend(moved);
        m.touch(parent);
        m.touch(left);
        m.free(right);
        trace!(?parent, ?left, ?right, "merge inner");
        Ok(())
    }

    fn remove_empty(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        parent: S::Address,
        child: S::Address,
    ) -> Result<()> {
        if !m.holds(child) || !m.tier(child)?.is_empty() {
            return Ok(());
        }
        let tier = inner_of(m.tier_mut(parent)?)?;
        let idx = match tier.index_of(child) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let (_, promoted) = tier.remove_branch(idx);
        if promoted.is_some() {
            m.replacement = promoted;
        }
        m.touch(parent);
        m.free(child);
        trace!(?parent, ?child, "remove empty");
        Ok(())
    }

    fn swap(&self, m: &mut Mutation<'_, K, V, S::Address>, address: S::Address) -> Result<()> {
        let replacement = match m.replacement.clone() {
            Some(r) if r != m.key => r,
            _ => return Ok(()),
        };
        let key = m.key.clone();
        let tier = inner_of(m.tier_mut(address)?)?;
        if let Some(branch) = tier
            .branches
            .iter_mut()
            .find(|b| b.pivot.as_ref() == Some(&key))
        {
            branch.pivot = Some(replacement);
            m.touch(address);
            trace!(tier = ?address, "swap pivot");
        }
        Ok(())
    }

    fn create_inner(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        child_type: ChildType,
        branches: Vec<Branch<K, S::Address>>,
    ) -> Result<S::Address> {
        let address = self.storage.allocate(TierKind::Inner, self.inner_capacity)?;
        let tier = Tier::Inner(InnerTier {
            address,
            child_type,
            branches,
        });
        m.created.push(self.pool.create(tier));
        Ok(address)
    }
}
