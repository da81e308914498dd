//! Internal error types for `corelink-core`.
//!
//! These never cross the public `corelink` API directly; a `Session`
//! maps them down into the stable numeric `SessionError` taxonomy.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("pool_size must be > 0 for a pooled channel")]
    InvalidPoolSize,

    #[error("reactor pool exhausted or not initialized")]
    ReactorUnavailable,

    #[error("timer producer queue is full")]
    TimerBusy,

    #[error("timer service is shut down")]
    TimerShutDown,
}
