//! Tree configuration and the key extractor.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::pool::PoolPolicy;
use crate::storage::Storage;
use crate::tier::Bucket;
use crate::tree::Strata;
use crate::writer::WritePolicy;

/// Derives the key a value is indexed by. Composite keys are expressed as
/// tuples or vectors, which order field by field.
///
/// Any `Fn(&V) -> K` closure is an extractor.
pub trait Extractor<K, V>: Send + Sync {
    /// The key for `value`.
    fn extract(&self, value: &V) -> K;
}

impl<K, V, F> Extractor<K, V> for F
where
    F: Fn(&V) -> K + Send + Sync,
{
    fn extract(&self, value: &V) -> K {
        self(value)
    }
}

/// Describes how to build or open a tree.
///
/// ```
/// use strata::{MemoryStorage, Schema};
///
/// let tree = Schema::new(|v: &(u32, String)| v.0)
///     .inner_capacity(5)
///     .leaf_capacity(7)
///     .create(MemoryStorage::new())
///     .unwrap();
/// tree.add((1, "one".to_string())).unwrap();
/// let mut cursor = tree.find(&1).unwrap();
/// assert_eq!(cursor.next_value().unwrap().1, "one");
/// ```
pub struct Schema<K, V> {
    pub(crate) inner_capacity: usize,
    pub(crate) leaf_capacity: usize,
    pub(crate) extractor: Arc<dyn Extractor<K, V>>,
    pub(crate) cache_fields: bool,
    pub(crate) write_policy: WritePolicy,
    pub(crate) pool_policy: PoolPolicy,
}

impl<K, V> fmt::Debug for Schema<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("inner_capacity", &self.inner_capacity)
            .field("leaf_capacity", &self.leaf_capacity)
            .field("cache_fields", &self.cache_fields)
            .field("write_policy", &self.write_policy)
            .field("pool_policy", &self.pool_policy)
            .finish()
    }
}

impl<K, V> Schema<K, V>
where
    K: Ord + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A schema with default capacities that indexes values by `extractor`.
    pub fn new<E: Extractor<K, V> + 'static>(extractor: E) -> Self {
        Schema {
            inner_capacity: 64,
            leaf_capacity: 64,
            extractor: Arc::new(extractor),
            cache_fields: true,
            write_policy: WritePolicy::Through,
            pool_policy: PoolPolicy::Weak,
        }
    }

    /// Maximum number of branches in an inner tier.
    pub fn inner_capacity(mut self, capacity: usize) -> Self {
        self.inner_capacity = capacity;
        self
    }

    /// Maximum number of buckets in a leaf.
    pub fn leaf_capacity(mut self, capacity: usize) -> Self {
        self.leaf_capacity = capacity;
        self
    }

    /// Store extracted keys alongside values (`true`), or derive them from
    /// the value every time they are compared (`false`).
    pub fn cache_fields(mut self, cache: bool) -> Self {
        self.cache_fields = cache;
        self
    }

    /// How dirty tiers reach storage.
    pub fn write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// How long tiers stay resident in the pool.
    pub fn pool_policy(mut self, policy: PoolPolicy) -> Self {
        self.pool_policy = policy;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.leaf_capacity < 2 {
            return Err(StrataError::Config(format!(
                "leaf capacity must be at least 2, got {}",
                self.leaf_capacity
            )));
        }
        if self.inner_capacity < 3 {
            return Err(StrataError::Config(format!(
                "inner capacity must be at least 3, got {}",
                self.inner_capacity
            )));
        }
        if let WritePolicy::PerTree { max_dirty: 0 } = self.write_policy {
            return Err(StrataError::Config(
                "per tree write policy needs a max_dirty above zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a new, empty tree in `storage`.
    pub fn create<S: Storage<K, V> + 'static>(self, storage: S) -> Result<Strata<K, V, S>> {
        self.validate()?;
        Strata::create(self, storage)
    }

    /// Attach to a tree previously created in `storage` with root `root`.
    pub fn open<S: Storage<K, V> + 'static>(
        self,
        storage: S,
        root: S::Address,
    ) -> Result<Strata<K, V, S>> {
        self.validate()?;
        Strata::open(self, storage, root)
    }
}

/// Produces and compares bucket keys, honouring the field caching policy.
pub(crate) struct Keys<K, V> {
    extractor: Arc<dyn Extractor<K, V>>,
    cache_fields: bool,
}

impl<K: Clone, V> Keys<K, V> {
    pub(crate) fn new(extractor: Arc<dyn Extractor<K, V>>, cache_fields: bool) -> Self {
        Keys {
            extractor,
            cache_fields,
        }
    }

    pub(crate) fn extract(&self, value: &V) -> K {
        self.extractor.extract(value)
    }

    pub(crate) fn key<'a>(&self, bucket: &'a Bucket<K, V>) -> Cow<'a, K> {
        match &bucket.key {
            Some(k) => Cow::Borrowed(k),
            None => Cow::Owned(self.extractor.extract(&bucket.value)),
        }
    }

    pub(crate) fn bucket(&self, key: K, value: V) -> Bucket<K, V> {
        Bucket {
            key: if self.cache_fields { Some(key) } else { None },
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_schema_rejects_small_capacities() {
        let r = Schema::new(|v: &u32| *v)
            .leaf_capacity(1)
            .create(MemoryStorage::new());
        assert!(matches!(r, Err(StrataError::Config(_))));

        let r = Schema::new(|v: &u32| *v)
            .inner_capacity(2)
            .create(MemoryStorage::new());
        assert!(matches!(r, Err(StrataError::Config(_))));

        let r = Schema::new(|v: &u32| *v)
            .write_policy(WritePolicy::PerTree { max_dirty: 0 })
            .create(MemoryStorage::new());
        assert!(matches!(r, Err(StrataError::Config(_))));
    }

    #[test]
    fn test_schema_keys_cache_policy() {
        let cached: Keys<u32, (u32, u32)> = Keys::new(Arc::new(|v: &(u32, u32)| v.0), true);
        let b = cached.bucket(3, (3, 9));
        assert_eq!(b.key, Some(3));
        assert_eq!(*cached.key(&b), 3);

        let derived: Keys<u32, (u32, u32)> = Keys::new(Arc::new(|v: &(u32, u32)| v.0), false);
        let b = derived.bucket(4, (4, 9));
        assert_eq!(b.key, None);
        assert_eq!(*derived.key(&b), 4);
    }
}
