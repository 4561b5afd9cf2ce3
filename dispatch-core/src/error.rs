use thiserror::Error;

/// Error taxonomy for the coordinator, matching the error-kinds from the
/// design: protocol, lifecycle, inventory, storage, worker-reported.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("duplicate resource id: {0}")]
    DuplicateId(String),

    #[error("unknown file type: {0}")]
    UnknownFileType(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl CoordinatorError {
    /// True for the kinds the design says are surfaced as an explicit
    /// `{fail:true, reason}` response rather than ending the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Lifecycle(_)
                | CoordinatorError::DuplicateId(_)
                | CoordinatorError::UnknownFileType(_)
        )
    }
}
