//! The tier pool resolves addresses to live tiers.
//!
//! Every tier handed out is tracked in a map of weak references, so as long
//! as anyone holds a tier, asking the pool for its address returns that same
//! tier and its lock. Once the last holder lets go the tier may be reclaimed,
//! and the next request reloads it from storage. The policy decides how many
//! tiers the pool holds on to by itself.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::Result;
use crate::storage::Storage;
use crate::tier::{Tier, TierRef};

/// How long the pool keeps tiers resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPolicy {
    /// Tiers are reclaimed as soon as nothing holds them.
    Weak,
    /// The most recently used tiers stay resident.
    Lru(NonZeroUsize),
    /// Every tier stays resident until it is freed.
    Pinned,
}

enum Retain<A, T> {
    Nothing,
    Recent(LruCache<A, T>),
    All(HashMap<A, T>),
}

struct PoolInner<K, V, A> {
    live: HashMap<A, Weak<RwLock<Tier<K, V, A>>>>,
    retain: Retain<A, TierRef<K, V, A>>,
}

pub(crate) struct TierPool<K, V, S>
where
    S: Storage<K, V>,
{
    storage: Arc<S>,
    inner: Mutex<PoolInner<K, V, S::Address>>,
}

impl<K, V, S> TierPool<K, V, S>
where
    S: Storage<K, V>,
{
    pub(crate) fn new(storage: Arc<S>, policy: PoolPolicy) -> Self {
        let retain = match policy {
            PoolPolicy::Weak => Retain::Nothing,
            PoolPolicy::Lru(n) => Retain::Recent(LruCache::new(n)),
            PoolPolicy::Pinned => Retain::All(HashMap::new()),
        };
        TierPool {
            storage,
            inner: Mutex::new(PoolInner {
                live: HashMap::new(),
                retain,
            }),
        }
    }

    /// The live tier at `address`, loading it from storage on a miss.
    pub(crate) fn get(&self, address: S::Address) -> Result<TierRef<K, V, S::Address>> {
        let mut inner = self.inner.lock();
        if let Some(tier) = inner.live.get(&address).and_then(Weak::upgrade) {
            inner.touch(address, &tier);
            return Ok(tier);
        }
        trace!(?address, "pool miss");
        let tier = Arc::new(RwLock::new(self.storage.load(address)?));
        inner.live.insert(address, Arc::downgrade(&tier));
        inner.touch(address, &tier);
        // Keep the weak map from growing without bound under churn.
        if inner.live.len() > 1024 && inner.live.len().is_power_of_two() {
            inner.live.retain(|_, w| w.strong_count() > 0);
        }
        Ok(tier)
    }

    /// Register a freshly allocated tier.
    pub(crate) fn create(&self, tier: Tier<K, V, S::Address>) -> TierRef<K, V, S::Address> {
        let address = tier.address();
        let tier = Arc::new(RwLock::new(tier));
        let mut inner = self.inner.lock();
        inner.live.insert(address, Arc::downgrade(&tier));
        inner.touch(address, &tier);
        tier
    }

    /// Drop a freed tier from the pool.
    pub(crate) fn forget(&self, address: S::Address) {
        let mut inner = self.inner.lock();
        inner.live.remove(&address);
        match &mut inner.retain {
            Retain::Nothing => {}
            Retain::Recent(lru) => {
                lru.pop(&address);
            }
            Retain::All(all) => {
                all.remove(&address);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn resident(&self) -> usize {
        self.inner
            .lock()
            .live
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl<K, V, A> PoolInner<K, V, A>
where
    A: crate::tier::Address,
{
    fn touch(&mut self, address: A, tier: &TierRef<K, V, A>) {
        match &mut self.retain {
            Retain::Nothing => {}
            Retain::Recent(lru) => {
                lru.put(address, tier.clone());
            }
            Retain::All(all) => {
                all.entry(address).or_insert_with(|| tier.clone());
            }
        }
    }
}
