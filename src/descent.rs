//! The descent shared by insert and remove.
//!
//! A mutation first goes down with read locks on the inner tiers, keeping
//! only the last few levels locked. When a decision says a parent may have
//! to change, the parent is re-locked for writing. At the root that happens
//! in place. Below it the grandparent is still read locked, so the parent
//! can be re-locked and the grandparent's decision checked again; if that
//! decision now holds as well the whole mutation starts over with write
//! locks from the root down. Levels that turn out not to need any change
//! are released as soon as a decision below them comes back empty.
//!
//! Locks are always taken root to leaf, and left to right among tiers of
//! the same depth. Leaves are locked in the order of the leaf list, chain
//! leaves included. No inner tier is locked while the mutation holds a leaf
//! lock.

use std::fmt::Debug;

use tracing::{debug, trace};

use crate::decision::{Decision, Limits};
use crate::error::{Result, StrataError};
use crate::leaf::Removal;
use crate::level::{Guard, Level, LockMode};
use crate::mutation::Mutation;
use crate::storage::Storage;
use crate::tier::{ChildType, WriteGuard};
use crate::tree::Shared;

/// Number of levels a descent keeps locked while nothing is pending.
const WINDOW: usize = 3;

pub(crate) enum Outcome {
    Done,
    /// Start over with write locks from the root.
    Restart,
    /// Start over with write locks and locate the left leaf on the way.
    Retry,
}

impl<K, V, S> Shared<K, V, S>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Storage<K, V>,
{
    fn limits(&self) -> Limits {
        Limits {
            inner: self.inner_capacity,
            leaf: self.leaf_capacity,
        }
    }

    /// Run `m` to completion, descending as many times as it takes.
    pub(crate) fn mutate(&self, m: &mut Mutation<'_, K, V, S::Address>) -> Result<()> {
        loop {
            let outcome = self.descend(m);
            m.reset();
            match outcome? {
                Outcome::Done => return Ok(()),
                Outcome::Restart => {
                    debug!(key = ?m.key, "restarting with write locks");
                    m.pessimistic = true;
                }
                Outcome::Retry if m.seek_left => {
                    return Err(StrataError::corrupt(
                        "left leaf not located on the second pass",
                    ));
                }
                Outcome::Retry => {
                    debug!(key = ?m.key, "second pass to locate the left leaf");
                    m.pessimistic = true;
                    m.seek_left = true;
                }
            }
        }
    }

    fn descend(&self, m: &mut Mutation<'_, K, V, S::Address>) -> Result<Outcome> {
        let limits = self.limits();
        let inserting = m.is_insert();
        let mode = if m.pessimistic {
            LockMode::Write
        } else {
            LockMode::Read
        };

        let root = self.pool.get(self.root)?;
        let mut level = Level::new(0, mode, self.root);
        level.lock(self.root, &root);
        m.levels.push(level);
        if !self.register_root(m)? {
            m.levels[0].relock(LockMode::Write);
            self.register_root(m)?;
        }

        let mut parent = self.root;
        loop {
            let pi = m.levels.len() - 1;
            let depth = m.levels[pi].depth + 1;
            let (idx, child, child_type, branches) = {
                let tier = m.levels[pi].get(parent)?.inner()?;
                let idx = tier.find(&m.key);
                (idx, tier.address_at(idx)?, tier.child_type, tier.branches.len())
            };
            if child_type == ChildType::Leaf {
                match self.descend_leaf(m, parent, depth)? {
                    Some(outcome) => return Ok(outcome),
                    // The root split while it was re-locked.
                    None => continue,
                }
            }
            let level = self.lock_children(m, pi, parent, idx, depth, inserting)?;
            let decisions = {
                let tier = m.levels[pi].get(parent)?.inner()?;
                Decision::inner(limits, inserting, &m.key, tier, idx, level.get(child)?)
            };
            if decisions.is_empty() {
                self.rewind(m, pi);
            } else if m.levels[pi].mode == LockMode::Read {
                std::mem::drop(level);
                if !self.escalate(m, pi, parent)? {
                    return Ok(Outcome::Restart);
                }
                continue;
            } else {
                self.register(m, pi, parent, idx, &decisions)?;
            }
            if idx > 0 {
                m.leftmost = false;
                m.fork = Some((parent, idx));
            }
            if branches > 1 {
                m.sole = false;
            }
            trace!(?parent, ?child, depth, "descend");
            m.levels.push(level);
            self.shift(m);
            parent = child;
        }
    }

    fn descend_leaf(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        parent: S::Address,
        depth: usize,
    ) -> Result<Option<Outcome>> {
        let limits = self.limits();
        let inserting = m.is_insert();
        loop {
            let pi = m.levels.len() - 1;
            let (idx, address, branches) = {
                let tier = m.levels[pi].get(parent)?.inner()?;
                // Only a root re-locked by `escalate` can have changed type.
                if tier.child_type != ChildType::Leaf {
                    return Ok(None);
                }
                let idx = tier.find(&m.key);
                (idx, tier.address_at(idx)?, tier.branches.len())
            };
            let exclusive = m.levels[pi].mode == LockMode::Write;
            // The left leaf is locked before the leaf itself.
            if exclusive && !inserting {
                if idx > 0 {
                    self.locate_left_leaf(m, parent, idx)?;
                } else if let Some((fork, at)) = m.fork.filter(|_| m.seek_left && branches == 1) {
                    self.locate_left_leaf(m, fork, at)?;
                }
            }

            let mut level = Level::new(depth, LockMode::Write, address);
            level.lock(address, &self.pool.get(address)?);
            let decisions = {
                let tier = m.levels[pi].get(parent)?.inner()?;
                let leaf = level.get(address)?.leaf()?;
                let past_chain = inserting && self.past_chain(leaf, &m.key)?;
                Decision::leaf(limits, inserting, &m.key, tier, idx, leaf, past_chain)
            };
            if decisions.is_empty() {
                self.rewind(m, pi);
            } else if !exclusive {
                std::mem::drop(level);
                if !self.escalate(m, pi, parent)? {
                    return Ok(Some(Outcome::Restart));
                }
                continue;
            } else {
                self.register(m, pi, parent, idx, &decisions)?;
            }
            if idx > 0 {
                m.leftmost = false;
                m.fork = Some((parent, idx));
            }
            if branches > 1 {
                m.sole = false;
            }

            m.levels.push(level);
            let li = m.levels.len() - 1;
            let changed = if inserting {
                self.leaf_insert(m, li, parent, address, idx)?;
                true
            } else {
                match self.leaf_remove(m, li, parent, address, idx)? {
                    Removal::Done(changed) => changed,
                    Removal::Retry => return Ok(Some(Outcome::Retry)),
                }
            };
            if changed {
                self.finish(m)?;
            }
            return Ok(Some(Outcome::Done));
        }
    }

    /// Register the root's own operations. Returns false if the root wants
    /// an operation but is only read locked.
    fn register_root(&self, m: &mut Mutation<'_, K, V, S::Address>) -> Result<bool> {
        let inserting = m.is_insert();
        let level = &mut m.levels[0];
        let decisions = Decision::root(self.limits(), inserting, level.get(self.root)?.inner()?);
        if decisions.is_empty() {
            return Ok(true);
        }
        if level.mode == LockMode::Read {
            return Ok(false);
        }
        let ops: Vec<_> = {
            let tier = level.get(self.root)?.inner()?;
            decisions
                .iter()
                .filter_map(|d| d.operation(tier, 0))
                .collect()
        };
        level.operations.extend(ops);
        Ok(true)
    }

    fn register(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        pi: usize,
        parent: S::Address,
        idx: usize,
        decisions: &[Decision],
    ) -> Result<()> {
        let level = &mut m.levels[pi];
        let ops: Vec<_> = {
            let tier = level.get(parent)?.inner()?;
            decisions
                .iter()
                .filter_map(|d| d.operation(tier, idx))
                .collect()
        };
        trace!(?parent, ?ops, "register");
        level.operations.extend(ops);
        Ok(())
    }

    /// Lock the inner child at `idx`. A removal under a write locked parent
    /// also locks a sibling to merge with, taken in index order.
    fn lock_children(
        &self,
        m: &Mutation<'_, K, V, S::Address>,
        pi: usize,
        parent: S::Address,
        idx: usize,
        depth: usize,
        inserting: bool,
    ) -> Result<Level<K, V, S::Address>> {
        let mode = m.levels[pi].mode;
        let tier = m.levels[pi].get(parent)?.inner()?;
        let child = tier.address_at(idx)?;
        let mut level = Level::new(depth, mode, child);
        let sibling = if mode == LockMode::Write && !inserting && tier.branches.len() > 1 {
            Some(if idx + 1 < tier.branches.len() {
                idx + 1
            } else {
                idx - 1
            })
        } else {
            None
        };
        match sibling {
            Some(s) if s < idx => {
                let left = tier.address_at(s)?;
                level.lock(left, &self.pool.get(left)?);
                level.lock(child, &self.pool.get(child)?);
            }
            Some(s) => {
                let right = tier.address_at(s)?;
                level.lock(child, &self.pool.get(child)?);
                level.lock(right, &self.pool.get(right)?);
            }
            None => level.lock(child, &self.pool.get(child)?),
        }
        Ok(level)
    }

    /// Re-lock the level at `pi` for writing. Returns false when the
    /// mutation has to start over.
    fn escalate(
        &self,
        m: &mut Mutation<'_, K, V, S::Address>,
        pi: usize,
        parent: S::Address,
    ) -> Result<bool> {
        trace!(?parent, depth = m.levels[pi].depth, "escalate");
        if m.levels[pi].depth == 0 {
            m.levels[pi].relock(LockMode::Write);
            self.register_root(m)?;
            return Ok(true);
        }
        if pi == 0 || m.levels[pi - 1].depth + 1 != m.levels[pi].depth {
            return Ok(false);
        }
        m.levels[pi].relock(LockMode::Write);
        let grandparent = &m.levels[pi - 1];
        let tier = grandparent.get(grandparent.address)?.inner()?;
        let idx = match tier.index_of(parent) {
            Some(idx) => idx,
            None => return Ok(false),
        };
        let decisions = Decision::inner(
            self.limits(),
            m.is_insert(),
            &m.key,
            tier,
            idx,
            m.levels[pi].get(parent)?,
        );
        Ok(decisions.is_empty())
    }

    /// Nothing below `pi` needs the levels above it to change: drop what can
    /// be dropped and release levels left with nothing to do, keeping the
    /// parent and grandparent.
    fn rewind(&self, m: &mut Mutation<'_, K, V, S::Address>, pi: usize) {
        for level in m.levels[..=pi].iter_mut() {
            level.cancel();
        }
        Self::release_above(m, pi.saturating_sub(1));
    }

    /// Keep at most the last few levels locked unless they have work.
    fn shift(&self, m: &mut Mutation<'_, K, V, S::Address>) {
        let keep = m.levels.len().saturating_sub(WINDOW);
        Self::release_above(m, keep);
    }

    fn release_above(m: &mut Mutation<'_, K, V, S::Address>, keep: usize) {
        // The left leaf of an only child is found from the fork, which has to
        // stay locked until then.
        if m.seek_left {
            return;
        }
        let mut i = 0;
        m.levels.retain(|level| {
            let release = i < keep && level.operations.is_empty();
            i += 1;
            !release
        });
    }

    /// Carry out the deferred operations and hand every changed tier to the
    /// writer while the locks are still held.
    fn finish(&self, m: &mut Mutation<'_, K, V, S::Address>) -> Result<()> {
        for i in (0..m.levels.len()).rev() {
            let ops = std::mem::take(&mut m.levels[i].operations);
            for op in ops.into_iter().rev() {
                self.execute(m, op)?;
            }
        }

        let freed = m.freed.clone();
        for address in m.dirty.iter().filter(|a| !freed.contains(a)) {
            if let Some(g) = m.left_leaf.as_ref().filter(|g| g.address() == *address) {
                self.writer.dirty(&mut m.session, WriteGuard::rwlock(g), g)?;
                continue;
            }
            match m.levels.iter().rev().find_map(|l| l.find(*address)) {
                Some(Guard::Write(g)) => {
                    self.writer.dirty(&mut m.session, WriteGuard::rwlock(g), g)?
                }
                _ => {
                    return Err(StrataError::corrupt(format!(
                        "changed tier {:?} is not write locked",
                        address
                    )))
                }
            }
        }
        for tier in m.created.iter() {
            let g = tier.read();
            if !freed.contains(&g.address()) {
                self.writer.dirty(&mut m.session, tier, &g)?;
            }
        }
        for address in freed {
            self.writer.remove(&mut m.session, address)?;
            self.pool.forget(address);
        }
        Ok(())
    }
}
