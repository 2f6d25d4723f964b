use thiserror::Error;

/// Unified error type for repository operations that application code can handle
#[derive(Error, Debug)]
pub enum DbError {
    /// Entity not found by the given identifier
    #[error("Entity not found")]
    NotFound,

    /// A row with the same id already exists (delivery rows are append-only)
    #[error("Conflicting update on {entity_type} {entity_id}: {reason}")]
    Conflict {
        entity_type: String,
        entity_id: String,
        reason: String,
    },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Other(anyhow::Error::new(err).context("failed to (de)serialize stored payload"))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
