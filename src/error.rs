use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid file type: {0}")]
    InvalidFileType(String),

    #[error("File too large: {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Look through an `anyhow::Error` for a crate error.
    pub fn find(err: &anyhow::Error) -> Option<&Error> {
        err.downcast_ref::<Error>()
    }

    pub fn is_invalid_transition(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Error::InvalidTransition { .. }))
    }

    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Error::NotFound(_)))
    }
}
