//! The write-back stage between the tree and storage.
//!
//! Mutations report every tier they change with `dirty` and every tier they
//! drop with `remove`. Depending on the policy these reach storage right away
//! or are staged and flushed in batches. A staged tier is a snapshot taken
//! while the mutation still held the tier's write lock, so flushing never
//! touches tier locks. The snapshot also pins the live tier, which keeps the
//! pool from reloading an address whose latest content is still staged.

use std::collections::HashMap;
use std::sync::Arc;

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::storage::Storage;
use crate::tier::{Tier, TierRef};

/// When dirty tiers are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Every change is written as it is reported.
    Through,
    /// Changes are staged for the length of one mutation and flushed as it
    /// ends. A mutation holds the tree's exclusive write gate from the first
    /// tier it changes until that flush, so staging mutations are serialised
    /// and those that change nothing are not.
    PerQuery,
    /// Changes accumulate across mutations. Once `max_dirty` tiers are staged
    /// the mutation that crossed the mark flushes them, excluding all other
    /// mutations while it does.
    PerTree {
        /// Staged tier count that triggers a flush.
        max_dirty: usize,
    },
}

struct Stage<K, V, A> {
    dirty: HashMap<A, (TierRef<K, V, A>, Tier<K, V, A>)>,
    freed: Vec<A>,
}

type GateRead = ArcRwLockReadGuard<RawRwLock, ()>;
type GateWrite = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Held by a mutation between `begin` and `end`.
pub(crate) enum Session {
    Unguarded,
    /// A per query session that has not changed anything yet.
    Idle,
    Exclusive(GateWrite),
    Shared(GateRead),
}

pub(crate) struct TierWriter<K, V, S>
where
    S: Storage<K, V>,
{
    policy: WritePolicy,
    storage: Arc<S>,
    gate: Arc<RwLock<()>>,
    stage: Mutex<Stage<K, V, S::Address>>,
}

impl<K, V, S> TierWriter<K, V, S>
where
    K: Clone,
    V: Clone,
    S: Storage<K, V>,
{
    pub(crate) fn new(storage: Arc<S>, policy: WritePolicy) -> Self {
        TierWriter {
            policy,
            storage,
            gate: Arc::new(RwLock::new(())),
            stage: Mutex::new(Stage {
                dirty: HashMap::new(),
                freed: Vec::new(),
            }),
        }
    }

    /// Must be called before a mutation takes any tier lock.
    pub(crate) fn begin(&self) -> Session {
        match self.policy {
            WritePolicy::Through => Session::Unguarded,
            WritePolicy::PerQuery => Session::Idle,
            WritePolicy::PerTree { .. } => Session::Shared(self.gate.read_arc()),
        }
    }

    /// A per query session takes the gate once it has something to stage,
    /// and keeps it until `end` has flushed.
    fn stage_for(&self, session: &mut Session) {
        if let Session::Idle = session {
            *session = Session::Exclusive(self.gate.write_arc());
        }
    }

    /// Record the new content of `tier`. The caller holds its write lock.
    pub(crate) fn dirty(
        &self,
        session: &mut Session,
        tier_ref: &TierRef<K, V, S::Address>,
        tier: &Tier<K, V, S::Address>,
    ) -> Result<()> {
        match self.policy {
            WritePolicy::Through => self.storage.write(tier),
            _ => {
                self.stage_for(session);
                self.stage
                    .lock()
                    .dirty
                    .insert(tier.address(), (tier_ref.clone(), tier.clone()));
                Ok(())
            }
        }
    }

    /// Cancel any staged write of `address` and schedule it to be freed.
    pub(crate) fn remove(&self, session: &mut Session, address: S::Address) -> Result<()> {
        match self.policy {
            WritePolicy::Through => self.storage.free(address),
            _ => {
                self.stage_for(session);
                let mut stage = self.stage.lock();
                stage.dirty.remove(&address);
                stage.freed.push(address);
                Ok(())
            }
        }
    }

    /// Must be called after the mutation released its tier locks.
    pub(crate) fn end(&self, session: Session) -> Result<()> {
        match (self.policy, session) {
            (WritePolicy::PerQuery, Session::Exclusive(_guard)) => self.drain(),
            (WritePolicy::PerTree { max_dirty }, session) => {
                std::mem::drop(session);
                let staged = {
                    let stage = self.stage.lock();
                    stage.dirty.len() + stage.freed.len()
                };
                if staged >= max_dirty {
                    self.flush()
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_gated(&self) -> bool {
        self.gate.is_locked_exclusive()
    }

    /// Write everything staged. Waits for running mutations under the per
    /// tree policy.
    pub(crate) fn flush(&self) -> Result<()> {
        match self.policy {
            WritePolicy::Through => Ok(()),
            WritePolicy::PerQuery | WritePolicy::PerTree { .. } => {
                let _guard = self.gate.write();
                self.drain()
            }
        }
    }

    fn drain(&self) -> Result<()> {
        let (dirty, freed) = {
            let mut stage = self.stage.lock();
            (
                std::mem::take(&mut stage.dirty),
                std::mem::take(&mut stage.freed),
            )
        };
        if dirty.is_empty() && freed.is_empty() {
            return Ok(());
        }
        debug!(dirty = dirty.len(), freed = freed.len(), "flushing tier writer");
        for (_, (_pin, snapshot)) in dirty.iter() {
            self.storage.write(snapshot)?;
        }
        for address in freed {
            self.storage.free(address)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn staged(&self) -> usize {
        let stage = self.stage.lock();
        stage.dirty.len() + stage.freed.len()
    }
}
