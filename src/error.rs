use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or invalid request parameters, including unusable source URLs.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The source URL could not be fetched or answered with a non-success status.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// The bulk CSV load into the ephemeral engine failed.
    #[error("Import error: {0}")]
    Import(String),

    #[error("Query error: {0}")]
    Query(String),

    /// Promotion precondition not met. Callers treat this as success.
    #[error("Table already persisted: {0}")]
    AlreadyPersisted(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Opening or writing one of the backing stores failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ApiError {
    /// Short category used in the `error` field of the error envelope.
    pub fn category(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "Bad request",
            ApiError::NotFound(_) => "Resource not found",
            ApiError::Fetch(_) => "URL fetch error",
            ApiError::Import(_) => "CSV import error",
            ApiError::Query(_) => "Query error",
            ApiError::AlreadyPersisted(_) => "Already persisted",
            ApiError::Persistence(_) => "Persistence error",
            ApiError::Storage(_) => "Storage error",
        }
    }

    /// Detail message without the category prefix.
    pub fn detail(&self) -> &str {
        match self {
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Fetch(m)
            | ApiError::Import(m)
            | ApiError::Query(m)
            | ApiError::AlreadyPersisted(m)
            | ApiError::Persistence(m)
            | ApiError::Storage(m) => m,
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
