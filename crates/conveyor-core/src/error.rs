use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found")]
    NotFound,

    #[error("invalid job state")]
    InvalidState,

    #[error("No handler registered for job type: {0}")]
    HandlerNotRegistered(String),

    #[error("handler registration error: {0}")]
    Registration(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("dispatch layer error: {0}")]
    Dispatch(String),

    #[error("dispatch driver not available: {0}")]
    DriverNotAvailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
