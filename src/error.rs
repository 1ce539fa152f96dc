use thiserror::Error;

/// The single error type surfaced by every public operation on [`crate::Store`].
///
/// Mirrors the kind set called out in the design: most variants name a
/// concrete recovery/format problem, `Closed` carries the cause that tripped
/// the store into its permanent panic state, and `Internal` is reserved for
/// invariant violations that should never occur outside of a bug.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Header/footer mismatch, bad checksum, or a missing required meta key.
    #[error("store is corrupt: {0}")]
    Corrupt(String),

    /// `format`/`formatRead` exceeds what this build supports, or `blockSize` mismatches.
    #[error("unsupported store format: {0}")]
    UnsupportedFormat(String),

    /// A page position names a chunk id that isn't known to the store.
    #[error("chunk {0} not found")]
    ChunkNotFound(u32),

    /// The store is closed, either deliberately or because it panicked.
    ///
    /// `cause` holds the original error when this resulted from a panic.
    #[error("store is closed{}", cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
    Closed { cause: Option<String> },

    /// A write was attempted on a read-only store, or the backing device failed.
    #[error("write failed: {0}")]
    WritingFailed(String),

    /// Another handle already holds the file lock for this store's path.
    #[error("failed to lock store file: {0}")]
    Locked(String),

    /// An assertion-level invariant was violated. Always routed through `panic()`.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// User error: duplicate map name, renaming the meta map, unknown version, etc.
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corrupt(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        StoreError::Internal(msg.into())
    }

    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        StoreError::Argument(msg.into())
    }

    /// True for errors that recovery is allowed to swallow while scanning a
    /// possibly-torn tail (see `verifyLastChunks` in the header module).
    pub(crate) fn is_recoverable_parse_error(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupt(_) | StoreError::ChunkNotFound(_) | StoreError::Io(_)
        )
    }
}
