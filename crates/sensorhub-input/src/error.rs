//! Error types for input devices.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("poll rate control {}: {source}", path.display())]
    PollRate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no input device matching {0:?}")]
    DeviceNotFound(String),
}
