//! A level is the set of tiers a mutation holds locked at one depth of the
//! tree, along with the operations it has deferred there. Dropping a level
//! releases every lock it holds, whichever way the descent exits.

use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Result, StrataError};
use crate::operation::Operation;
use crate::tier::{Address, ReadGuard, Tier, TierRef, WriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Read,
    Write,
}

pub(crate) enum Guard<K, V, A> {
    Read(ReadGuard<K, V, A>),
    Write(WriteGuard<K, V, A>),
}

impl<K, V, A: Address> Guard<K, V, A> {
    pub(crate) fn acquire(tier: &TierRef<K, V, A>, mode: LockMode) -> Self {
        match mode {
            LockMode::Read => Guard::Read(tier.read_arc()),
            LockMode::Write => Guard::Write(tier.write_arc()),
        }
    }

    pub(crate) fn tier(&self) -> &Tier<K, V, A> {
        match self {
            Guard::Read(g) => g,
            Guard::Write(g) => g,
        }
    }

    pub(crate) fn tier_mut(&mut self) -> Result<&mut Tier<K, V, A>> {
        match self {
            Guard::Write(g) => Ok(&mut *g),
            Guard::Read(g) => Err(StrataError::corrupt(format!(
                "tier {:?} modified under a read lock",
                g.address()
            ))),
        }
    }

    pub(crate) fn tier_ref(&self) -> &TierRef<K, V, A> {
        match self {
            Guard::Read(g) => ReadGuard::rwlock(g),
            Guard::Write(g) => WriteGuard::rwlock(g),
        }
    }

    pub(crate) fn address(&self) -> A {
        self.tier().address()
    }
}

pub(crate) struct Level<K, V, A> {
    pub(crate) depth: usize,
    /// The tier on the path of the key, the others are siblings.
    pub(crate) address: A,
    pub(crate) mode: LockMode,
    locks: SmallVec<[Guard<K, V, A>; 4]>,
    pub(crate) operations: Vec<Operation<A>>,
}

impl<K, V, A: Address> Level<K, V, A> {
    pub(crate) fn new(depth: usize, mode: LockMode, address: A) -> Self {
        Level {
            depth,
            address,
            mode,
            locks: SmallVec::new(),
            operations: Vec::new(),
        }
    }

    /// Lock `tier` in this level's mode. Locking a tier already held here
    /// is a no-op, the locks are not reentrant.
    pub(crate) fn lock(&mut self, address: A, tier: &TierRef<K, V, A>) {
        if self.holds(address) {
            return;
        }
        self.locks.push(Guard::acquire(tier, self.mode));
    }

    pub(crate) fn holds(&self, address: A) -> bool {
        self.locks.iter().any(|g| g.address() == address)
    }

    pub(crate) fn get(&self, address: A) -> Result<&Tier<K, V, A>> {
        self.locks
            .iter()
            .find(|g| g.address() == address)
            .map(Guard::tier)
            .ok_or_else(|| {
                StrataError::corrupt(format!("tier {:?} is not locked at depth {}", address, self.depth))
            })
    }

    pub(crate) fn get_mut(&mut self, address: A) -> Result<&mut Tier<K, V, A>> {
        let depth = self.depth;
        match self.locks.iter_mut().find(|g| g.address() == address) {
            Some(g) => g.tier_mut(),
            None => Err(StrataError::corrupt(format!(
                "tier {:?} is not locked at depth {}",
                address, depth
            ))),
        }
    }

    pub(crate) fn find(&self, address: A) -> Option<&Guard<K, V, A>> {
        self.locks.iter().find(|g| g.address() == address)
    }

    /// Release every lock and take them again in `mode`. The tiers are
    /// unlocked in between, so anything evaluated under the old locks has
    /// to be evaluated again.
    pub(crate) fn relock(&mut self, mode: LockMode) {
        trace!(depth = self.depth, ?mode, "relock level");
        let tiers: SmallVec<[TierRef<K, V, A>; 4]> =
            self.locks.iter().map(|g| g.tier_ref().clone()).collect();
        self.locks.clear();
        self.mode = mode;
        for tier in tiers.iter() {
            self.locks.push(Guard::acquire(tier, mode));
        }
    }

    pub(crate) fn cancel(&mut self) {
        self.operations.retain(|op| !op.can_cancel());
    }
}
