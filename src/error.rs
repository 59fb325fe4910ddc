//! Error types for media preparation and feed coordination.

/// Failure to turn an item id into a playable URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The item has no playable media attached.
    #[error("No media found for item {0}")]
    NotFound(String),

    /// Transport or server failure while resolving.
    #[error("Network error: {0}")]
    Network(String),
}

/// Reasons a preparation did not produce a ready handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrepareError {
    /// The resolver could not produce a URL (or did not answer in time).
    #[error("Failed to resolve media URL: {0}")]
    ResolveFailure(String),

    /// Asset or metadata loading exceeded its time bound.
    #[error("Timed out while loading media: {0}")]
    PrepareTimeout(String),

    /// The asset loaded but cannot be played.
    #[error("Media is not playable: {0}")]
    Unplayable(String),

    /// The handle was evicted or cancelled while preparing.
    #[error("Preparation cancelled")]
    Cancelled,

    /// A newer index change invalidated the governing operation token.
    #[error("Preparation superseded by a newer index change")]
    Superseded,

    /// The pool was found in a state that should be impossible.
    #[error("Resource pool invariant violated: {0}")]
    PoolInvariantViolation(String),
}

impl PrepareError {
    /// Whether this failure should be surfaced to the UI as a retryable item error.
    ///
    /// Cancellation and supersession are expected outcomes of scrolling, not failures.
    pub fn is_failure(&self) -> bool {
        !matches!(self, PrepareError::Cancelled | PrepareError::Superseded)
    }
}

impl From<ResolveError> for PrepareError {
    fn from(err: ResolveError) -> Self {
        PrepareError::ResolveFailure(err.to_string())
    }
}

/// Errors returned by index-change requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// No items have been loaded yet.
    #[error("Feed is empty")]
    EmptyFeed,

    /// The requested index is outside the loaded sequence.
    #[error("Index {index} out of range (feed has {len} items)")]
    IndexOutOfRange { index: usize, len: usize },

    /// The requested item id is not part of the feed.
    #[error("Unknown item {0}")]
    UnknownItem(String),
}
