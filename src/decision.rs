//! Decisions examine a parent and child pair on the way down and say whether
//! the mutation may have to restructure them. A decision that holds forces
//! the parent to be write locked, and once it is, becomes an operation
//! deferred on the parent's level.

use smallvec::SmallVec;

use crate::operation::Operation;
use crate::tier::{Address, ChildType, InnerTier, LeafTier, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    SplitRoot,
    SplitInner,
    MergeRoot,
    MergeInner,
    RemoveOnlyChild,
    SwapKey,
    SplitLeaf,
    MergeLeaf,
}

pub(crate) type Decisions = SmallVec<[Decision; 3]>;

/// Capacities the decisions are measured against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) inner: usize,
    pub(crate) leaf: usize,
}

impl Limits {
    /// At or below this many branches an inner tier is worth merging.
    fn inner_small(&self) -> usize {
        self.inner / 2
    }

    fn leaf_small(&self) -> usize {
        self.leaf / 2 + 1
    }
}

impl Decision {
    /// Decisions about the root alone.
    pub(crate) fn root<K, A: Address>(
        limits: Limits,
        inserting: bool,
        root: &InnerTier<K, A>,
    ) -> Decisions {
        let mut out = Decisions::new();
        if inserting {
            if root.branches.len() >= limits.inner {
                out.push(Decision::SplitRoot);
            }
        } else if root.child_type == ChildType::Inner && root.branches.len() <= 2 {
            out.push(Decision::MergeRoot);
        }
        out
    }

    /// Decisions about an inner `child` reached through branch `idx` of
    /// `parent`. The order is the order the operations are registered in.
    pub(crate) fn inner<K: Ord, V, A: Address>(
        limits: Limits,
        inserting: bool,
        key: &K,
        parent: &InnerTier<K, A>,
        idx: usize,
        child: &Tier<K, V, A>,
    ) -> Decisions {
        let mut out = Decisions::new();
        let size = child.len();
        if inserting {
            if size >= limits.inner {
                out.push(Decision::SplitInner);
            }
            return out;
        }
        if size == 1 {
            out.push(Decision::RemoveOnlyChild);
        } else if parent.branches.len() > 1 && size <= limits.inner_small() {
            out.push(Decision::MergeInner);
        }
        if parent.branches[idx].pivot.as_ref() == Some(key) {
            out.push(Decision::SwapKey);
        }
        out
    }

    /// Whether the mutation may change the parent of `leaf`. A removal that
    /// hits a pivot also needs the branch holding it, which the inner
    /// decisions cover when the pivot sits above the parent. `past_chain`
    /// says an insert goes beyond the end of a chain of equal keys that
    /// follows the leaf, where it starts a new indexed leaf.
    pub(crate) fn leaf<K: Ord + Clone, V, A: Address>(
        limits: Limits,
        inserting: bool,
        key: &K,
        parent: &InnerTier<K, A>,
        idx: usize,
        leaf: &LeafTier<K, V, A>,
        past_chain: bool,
    ) -> Decisions {
        let mut out = Decisions::new();
        let size = leaf.buckets.len();
        if inserting {
            if size >= limits.leaf || past_chain {
                out.push(Decision::SplitLeaf);
            }
            return out;
        }
        if size <= limits.leaf_small() {
            out.push(Decision::MergeLeaf);
        }
        if parent.branches[idx].pivot.as_ref() == Some(key) {
            out.push(Decision::SwapKey);
        }
        out
    }

    /// The operation this decision defers once the parent is write locked.
    pub(crate) fn operation<K, A: Address>(
        &self,
        parent: &InnerTier<K, A>,
        idx: usize,
    ) -> Option<Operation<A>> {
        let child = parent.branches[idx].address;
        match self {
            Decision::SplitRoot => Some(Operation::SplitRoot {
                root: parent.address,
            }),
            Decision::MergeRoot => Some(Operation::MergeRoot {
                root: parent.address,
            }),
            Decision::SplitInner if parent.child_type == ChildType::Inner => {
                Some(Operation::SplitInner {
                    parent: parent.address,
                    child,
                })
            }
            Decision::MergeInner if parent.child_type == ChildType::Inner => {
                let (left, right) = if idx + 1 < parent.branches.len() {
                    (child, parent.branches[idx + 1].address)
                } else {
                    (parent.branches[idx - 1].address, child)
                };
                Some(Operation::MergeInner {
                    parent: parent.address,
                    left,
                    right,
                })
            }
            Decision::RemoveOnlyChild => Some(Operation::RemoveEmpty {
                parent: parent.address,
                child,
            }),
            Decision::SwapKey => Some(Operation::Swap {
                tier: parent.address,
            }),
            // Leaf splits and merges are carried out by the leaf itself.
            _ => None,
        }
    }
}
