use thiserror::Error;

/// Errors surfaced by image operations.
///
/// Admin operations are either atomic or resumable; when an error is
/// returned no partial effect is observable unless the variant says
/// otherwise (`Restart`, `Timeout` are retried internally before they
/// ever reach a caller).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    /// Write-class operation against a snapshot selection or a read-only
    /// image.
    #[error("read-only")]
    ReadOnly,

    /// Image, snapshot or object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name collision on create, clone, rename or snapshot create.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Argument or state error: bad order, offset past end, flatten of an
    /// image without a parent, and similar.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Operation requires a feature the image does not have enabled.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The image persists an incompatible feature bit this build does not
    /// recognize; it must not be opened.
    #[error("unsupported incompatible features: {missing:#x}")]
    UnsupportedIncompatible { missing: u64 },

    /// Resource is in use: protected snapshot with children, lock holder
    /// refusing release, and similar.
    #[error("busy: {0}")]
    Busy(String),

    /// A remote request was not answered within the deadline.
    #[error("timed out waiting for peer")]
    Timeout,

    /// Internal retry signal: the operation observed concurrent state
    /// movement and must be re-driven from the top. Absorbed by the
    /// invoke envelope a bounded number of times.
    #[error("restart")]
    Restart,

    /// Persisted metadata failed validation (bad header signature, invalid
    /// snapshot context). Fatal for the operation; the context remains
    /// usable at its previous refresh point.
    #[error("corrupt metadata: {0}")]
    Corrupt(String),

    /// Error reported by the object store.
    #[error("object store error: {0}")]
    Io(String),

    /// Lock acquisition would block and the caller asked not to wait.
    #[error("would block on exclusive lock")]
    WouldBlock,
}

impl ImageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ImageError::NotFound(_))
    }

    pub fn is_restart(&self) -> bool {
        matches!(self, ImageError::Restart)
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;
