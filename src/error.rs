//! Errors raised by the tree, its cursors and its collaborators.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Everything that can go wrong while working with a [Strata](crate::Strata).
///
/// A missing key is not an error: lookups return `Ok(None)` or an empty
/// cursor instead.
#[derive(Debug, Error)]
pub enum StrataError {
    /// The tree failed a structural consistency check. This is fatal and is
    /// never retried.
    #[error("tree is corrupt: {0}")]
    Corrupt(String),

    /// A cursor was advanced after it was released or exhausted.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The schema given to build or open a tree is unusable.
    #[error("invalid schema: {0}")]
    Config(String),

    /// Storage was asked for an address it does not know.
    #[error("tier not found at address {0}")]
    TierNotFound(String),

    /// A failure raised by the storage collaborator, passed through as is.
    #[error(transparent)]
    Storage(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl StrataError {
    pub(crate) fn corrupt<S: Into<String>>(msg: S) -> Self {
        StrataError::Corrupt(msg.into())
    }
}
