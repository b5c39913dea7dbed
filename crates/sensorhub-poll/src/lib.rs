//! sensorhub-poll: generic poll/interrupt I/O engine.
//!
//! A [`PollEngine`] owns the descriptors of one hardware channel and runs
//! exactly one worker thread while any adapted channel holds a reference.
//! What happens on each readiness tick is supplied by a [`SampleProcessor`].

pub mod engine;
pub mod error;
pub mod power;
pub mod source;
pub mod sysfs;
mod worker;

pub use engine::{AdaptedChannel, EngineStatus, PollEngine, PollMode, SampleProcessor, StandbyState};
pub use error::PollError;
pub use power::PowerControl;
pub use source::WatchedSource;
pub use sysfs::{SysfsProcessor, parse_sysfs_values};
