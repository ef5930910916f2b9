use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue is stopped")]
    Stopped,

    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "embedded")]
impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}
