#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The row does not exist. Expected during upsert; triggers the
    /// create path.
    #[error("row not found: {0}")]
    NotFound(String),

    /// The row already exists. Expected during upsert when another
    /// writer (e.g. a second tab) raced the create; triggers one
    /// retried update.
    #[error("row already exists: {0}")]
    Conflict(String),

    /// The store rejected the operation for lack of permission.
    /// Non-fatal: callers degrade to receive-only mode.
    #[error("permission denied")]
    PermissionDenied,

    /// The store or its notification channel is gone.
    #[error("store closed")]
    Closed,

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A sub-document payload the serializer rejected.
    #[error("encode error: {0}")]
    Encode(String),
}
