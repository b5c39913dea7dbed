//! Error types for the session layer.

use std::path::PathBuf;

use sensorhub_core::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("another listener is already serving {}", .0.display())]
    AddressInUse(PathBuf),

    #[error("client closed the connection before sending a session id")]
    MissingSessionId,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("malformed session id {0}")]
    MalformedSessionId(SessionId),

    #[error("session {0} is already bound")]
    DuplicateSession(SessionId),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
