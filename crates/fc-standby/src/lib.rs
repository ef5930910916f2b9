//! Advisory-lock leader election.
//!
//! Consumer and scheduler singletons each hold a Redis lock keyed by role.
//! The lock is a `SET NX EX` with periodic Lua check-and-extend; losing it
//! means the holder pauses intake immediately and resumes only after
//! reacquisition. No in-memory state is assumed to survive a handover.

use thiserror::Error;

pub mod leader;

pub use leader::{LeaderConfig, LeaderElector, LeaderStatus};

#[derive(Error, Debug)]
pub enum StandbyError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("election already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, StandbyError>;
