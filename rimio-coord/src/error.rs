use crate::store::{StoreError, StoreErrorCode};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordError>;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("use of closed coordination client")]
    ClosedClient,

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    NodeExists(String),

    #[error("not a file: {0}")]
    NotFile(String),

    #[error("not a dir: {0}")]
    NotDir(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request canceled")]
    Canceled,

    #[error("invalid auth")]
    InvalidAuth,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl CoordError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoordError::NotFound(_))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, CoordError::NodeExists(_))
    }

    /// True for errors caused by the client being shut down rather than by the store.
    pub fn is_closed(&self) -> bool {
        matches!(self, CoordError::ClosedClient | CoordError::Canceled)
    }
}

/// Maps a store-reported error onto the coordination error taxonomy.
pub fn classify(error: StoreError) -> CoordError {
    match error.code {
        StoreErrorCode::KeyNotFound => CoordError::NotFound(error.key),
        StoreErrorCode::NodeExist => CoordError::NodeExists(error.key),
        StoreErrorCode::NotFile => CoordError::NotFile(error.key),
        StoreErrorCode::NotDir => CoordError::NotDir(error.key),
        _ => CoordError::Store(error),
    }
}

impl From<StoreError> for CoordError {
    fn from(error: StoreError) -> Self {
        classify(error)
    }
}
