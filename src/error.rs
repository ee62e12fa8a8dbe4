use thiserror::Error;
use uuid::Uuid;

use crate::Status;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected at submission; no job record exists.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is {status}")]
    NotReady { id: Uuid, status: Status },

    #[error("invalid transition from {from} to {to}")]
    Transition { from: Status, to: Status },

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("backend: {0}")]
    Backend(String),
}
