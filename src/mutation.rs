//! State carried by a single insert or remove as it descends the tree.

use smallvec::SmallVec;

use crate::error::{Result, StrataError};
use crate::level::Level;
use crate::tier::{Address, Tier, TierRef, WriteGuard};
use crate::writer::Session;

/// What the mutation does once it reaches its leaf.
pub(crate) enum Intent<'a, V> {
    /// Insert the value. It is taken out when the leaf accepts it.
    Insert(Option<V>),
    /// Remove the first value with the key that the predicate accepts.
    Remove(&'a (dyn Fn(&V) -> bool + 'a)),
}

pub(crate) struct Mutation<'a, K, V, A> {
    pub(crate) key: K,
    pub(crate) intent: Intent<'a, V>,
    /// Locked levels, root side first. Levels released by the descent are
    /// dropped from the front, so indexes are not depths.
    pub(crate) levels: Vec<Level<K, V, A>>,
    /// Take write locks all the way down.
    pub(crate) pessimistic: bool,
    /// Keep every level locked and locate the leaf left of an only child.
    pub(crate) seek_left: bool,
    /// Every tier on the path so far was entered through its first branch.
    pub(crate) leftmost: bool,
    /// Every tier on the path so far has a single branch.
    pub(crate) sole: bool,
    /// The deepest tier on the path entered through a branch other than its
    /// first, with the branch index.
    pub(crate) fork: Option<(A, usize)>,
    /// The leaf immediately before the leftmost leaf of the path's subtree.
    pub(crate) left_leaf: Option<WriteGuard<K, V, A>>,
    /// Key that takes the place of a removed key in the branch above.
    pub(crate) replacement: Option<K>,
    pub(crate) removed: Option<V>,
    pub(crate) dirty: SmallVec<[A; 8]>,
    pub(crate) created: Vec<TierRef<K, V, A>>,
    pub(crate) freed: SmallVec<[A; 4]>,
    /// The writer session the changes are reported under.
    pub(crate) session: Session,
}

impl<'a, K, V, A: Address> Mutation<'a, K, V, A> {
    pub(crate) fn insert(key: K, value: V, session: Session) -> Self {
        Self::new(key, Intent::Insert(Some(value)), session)
    }

    pub(crate) fn remove(
        key: K,
        deletable: &'a (dyn Fn(&V) -> bool + 'a),
        session: Session,
    ) -> Self {
        Self::new(key, Intent::Remove(deletable), session)
    }

    fn new(key: K, intent: Intent<'a, V>, session: Session) -> Self {
        Mutation {
            key,
            intent,
            levels: Vec::new(),
            pessimistic: false,
            seek_left: false,
            leftmost: true,
            sole: true,
            fork: None,
            left_leaf: None,
            replacement: None,
            removed: None,
            dirty: SmallVec::new(),
            created: Vec::new(),
            freed: SmallVec::new(),
            session,
        }
    }

    /// Hand the session back to the writer once the mutation is over.
    pub(crate) fn into_session(self) -> Session {
        self.session
    }

    pub(crate) fn is_insert(&self) -> bool {
        matches!(self.intent, Intent::Insert(_))
    }

    /// Release everything and forget what the last pass learned, ready for
    /// another descent.
    pub(crate) fn reset(&mut self) {
        self.left_leaf = None;
        // Deepest first, the order the locks were taken in reverse.
        while self.levels.pop().is_some() {}
        self.leftmost = true;
        self.sole = true;
        self.fork = None;
        self.replacement = None;
        self.dirty.clear();
        self.created.clear();
        self.freed.clear();
    }

    pub(crate) fn touch(&mut self, address: A) {
        if !self.dirty.contains(&address) {
            self.dirty.push(address);
        }
    }

    pub(crate) fn free(&mut self, address: A) {
        self.freed.push(address);
    }

    /// The locked tier at `address`, wherever the mutation holds it.
    pub(crate) fn tier(&self, address: A) -> Result<&Tier<K, V, A>> {
        if let Some(g) = self.left_leaf.as_ref() {
            if g.address() == address {
                return Ok(g);
            }
        }
        for level in self.levels.iter().rev() {
            if level.holds(address) {
                return level.get(address);
            }
        }
        Err(StrataError::corrupt(format!(
            "tier {:?} is not held by the mutation",
            address
        )))
    }

    pub(crate) fn tier_mut(&mut self, address: A) -> Result<&mut Tier<K, V, A>> {
        if let Some(g) = self.left_leaf.as_mut() {
            if g.address() == address {
                return Ok(&mut *g);
            }
        }
        for level in self.levels.iter_mut().rev() {
            if level.holds(address) {
                return level.get_mut(address);
            }
        }
        Err(StrataError::corrupt(format!(
            "tier {:?} is not held by the mutation",
            address
        )))
    }

    pub(crate) fn holds(&self, address: A) -> bool {
        self.left_leaf
            .as_ref()
            .map(|g| g.address() == address)
            .unwrap_or(false)
            || self.levels.iter().any(|l| l.holds(address))
    }
}
