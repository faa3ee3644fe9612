use thiserror::Error;

/// Errors produced by the tiled-file durability substrate.
///
/// These mirror the five named error kinds in the engine's error
/// handling design plus raw OS errors; callers match on kind rather
/// than string content.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Lookup found no such entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Async operation has not completed yet; retry.
    #[error("operation in progress")]
    More,

    /// Operation had no work to do.
    #[error("already done")]
    Already,

    /// Duplicate insert rejected.
    #[error("already exists: {0}")]
    Exists(String),

    /// Corruption detected: bad magic, broken sentinel, misaligned size.
    #[error("database corruption: {0}")]
    Database(String),

    /// Raw OS error from an I/O call.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn database(msg: impl Into<String>) -> Self {
        StoreError::Database(msg.into())
    }

    pub fn is_more(&self) -> bool {
        matches!(self, StoreError::More)
    }

    pub fn is_already(&self) -> bool {
        matches!(self, StoreError::Already)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
