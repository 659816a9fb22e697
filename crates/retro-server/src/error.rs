use thiserror::Error;

/// Storage-layer failures: the Directory's user/regkey store or a
/// recipient's offline-message store could not complete an operation.
/// Callers surface these as `T_ERROR "Internal server error"`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
