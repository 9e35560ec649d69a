//! Strata - a concurrent B+tree over pluggable storage.
//!
//! A strata tree stores values ordered by a key derived from each value. Many
//! threads can insert, remove and read at the same time: every tier of the
//! tree has its own reader-writer lock, and a mutation only holds the locks
//! of the tiers it may actually change.
//!
//! Writers descend optimistically with read locks and re-lock for writing
//! only where a split or merge may be needed, starting over with write locks
//! from the root when that is the only safe way through. Splits and merges
//! are planned on the way down and carried out bottom up once the leaf has
//! been changed.
//!
//! Values with equal keys are all kept, in insertion order, and may spill
//! over into chain leaves when there are more of them than fit in a leaf.
//!
//! Where tiers live is up to a [Storage] implementation. [MemoryStorage]
//! keeps them in a map. Tiers are cached in a pool while in use, and changed
//! tiers are written back according to the [WritePolicy].
//!
//! ```
//! use strata::{MemoryStorage, Schema};
//!
//! let tree = Schema::new(|v: &u64| *v)
//!     .leaf_capacity(4)
//!     .create(MemoryStorage::new())
//!     .unwrap();
//! for v in [5, 3, 9, 3] {
//!     tree.add(v).unwrap();
//! }
//! assert_eq!(tree.remove(&9).unwrap(), Some(9));
//! let all: Vec<u64> = tree.first().unwrap().map(|v| v.unwrap()).collect();
//! assert_eq!(all, vec![3, 3, 5]);
//! ```

#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::too_many_arguments)]

mod cursor;
mod decision;
mod descent;
mod error;
mod leaf;
mod level;
mod mutation;
mod operation;
mod pool;
mod schema;
mod storage;
mod tier;
mod tree;
mod writer;

pub use crate::cursor::Cursor;
pub use crate::error::{Result, StrataError};
pub use crate::pool::PoolPolicy;
pub use crate::schema::{Extractor, Schema};
pub use crate::storage::{MemoryStorage, Storage};
pub use crate::tier::{Address, Branch, Bucket, ChildType, InnerTier, LeafTier, Tier, TierKind};
pub use crate::tree::Strata;
pub use crate::writer::WritePolicy;
