//! Error types for the poll engine.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("engine {0:?} has no sources to monitor")]
    NoSources(String),

    #[error("unknown channel {0:?}")]
    UnknownChannel(String),

    #[error("channel {0:?} is already adapted")]
    DuplicateChannel(String),

    #[error("engine {0:?} runs in interrupt mode and has no interval")]
    NotIntervalMode(String),

    #[error("failed to create cancellation pipe: {0}")]
    Pipe(#[source] std::io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}
