//! Engine error taxonomy

use persistence::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Store unavailable, timed out or rejected the operation
    #[error("store error: {0}")]
    Store(#[from] DbError),

    /// The engine state document could not be encoded or decoded
    #[error("engine state document: {0}")]
    State(#[from] serde_json::Error),

    /// A round or stored row that cannot be interpreted
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Compare-and-set on the engine state kept losing to other writers
    #[error("engine state contention, gave up after {0} attempts")]
    Contention(usize),
}

pub type EngineResult<T> = Result<T, EngineError>;
