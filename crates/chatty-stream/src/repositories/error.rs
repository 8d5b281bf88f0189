use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    #[error("Repository unavailable: {message}")]
    Unavailable { message: String },
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
