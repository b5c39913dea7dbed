//! sensorhub-session: the data socket.
//!
//! [`SessionMultiplexer`] accepts local clients, runs the preamble and
//! session-id handshake, and fans sample bytes out to bound sessions. Each
//! session is served by one task that applies its [`SessionConfig`] pacing.

mod connection;
pub mod error;
pub mod multiplexer;
pub mod pacing;

pub use error::SessionError;
pub use multiplexer::{MultiplexerConfig, SessionEvent, SessionMultiplexer, WriteOutcome};
pub use pacing::SessionConfig;
