//! The storage collaborator. The tree asks storage for addresses, hands it
//! tiers to persist and reloads tiers the pool no longer holds. What an
//! address looks like, and how tiers are encoded, is entirely up to the
//! implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, StrataError};
use crate::tier::{Address, Tier, TierKind};

/// Backing storage for the tiers of a tree.
///
/// Implementations must be safe to call from many threads at once. Errors
/// raised here are passed back to the caller of the tree untouched.
pub trait Storage<K, V>: Send + Sync {
    /// The address type handed out by this storage.
    type Address: Address;

    /// Reserve an address for a new tier of the given kind and capacity.
    fn allocate(&self, kind: TierKind, capacity: usize) -> Result<Self::Address>;

    /// Load the tier stored at `address`.
    fn load(&self, address: Self::Address) -> Result<Tier<K, V, Self::Address>>;

    /// Persist a tier at its own address.
    fn write(&self, tier: &Tier<K, V, Self::Address>) -> Result<()>;

    /// Release the address of a tier that is no longer part of the tree.
    fn free(&self, address: Self::Address) -> Result<()>;

    /// The reserved address meaning "no such tier".
    fn null(&self) -> Self::Address;

    /// True if `address` is the null address.
    fn is_null(&self, address: Self::Address) -> bool {
        address == self.null()
    }
}

/// Storage that keeps every written tier in a map, addressed by a counter.
/// Address `0` is null. Addresses are never reused.
#[derive(Debug)]
pub struct MemoryStorage<K, V> {
    next: AtomicU64,
    tiers: Mutex<HashMap<u64, Tier<K, V, u64>>>,
}

impl<K, V> Default for MemoryStorage<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MemoryStorage<K, V> {
    /// An empty storage.
    pub fn new() -> Self {
        MemoryStorage {
            next: AtomicU64::new(1),
            tiers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tiers currently written.
    pub fn len(&self) -> usize {
        self.tiers.lock().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.tiers.lock().is_empty()
    }
}

impl<K: Clone, V: Clone> MemoryStorage<K, V> {
    /// A copy of everything written so far. The copy hands out addresses
    /// from where this storage left off.
    pub fn snapshot(&self) -> Self {
        MemoryStorage {
            next: AtomicU64::new(self.next.load(Ordering::Acquire)),
            tiers: Mutex::new(self.tiers.lock().clone()),
        }
    }
}

impl<K, V> Storage<K, V> for MemoryStorage<K, V>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    type Address = u64;

    fn allocate(&self, _kind: TierKind, _capacity: usize) -> Result<u64> {
        Ok(self.next.fetch_add(1, Ordering::AcqRel))
    }

    fn load(&self, address: u64) -> Result<Tier<K, V, u64>> {
        self.tiers
            .lock()
            .get(&address)
            .cloned()
            .ok_or_else(|| StrataError::TierNotFound(address.to_string()))
    }

    fn write(&self, tier: &Tier<K, V, u64>) -> Result<()> {
        self.tiers.lock().insert(tier.address(), tier.clone());
        Ok(())
    }

    fn free(&self, address: u64) -> Result<()> {
        self.tiers.lock().remove(&address);
        Ok(())
    }

    fn null(&self) -> u64 {
        0
    }
}
