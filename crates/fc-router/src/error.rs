use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool {0} is at capacity")]
    PoolSaturated(String),

    #[error("pool {0} rejects new submissions")]
    PoolClosed(String),

    #[error("queue error: {0}")]
    Queue(#[from] fc_queue::QueueError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
