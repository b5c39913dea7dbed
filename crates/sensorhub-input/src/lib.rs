//! sensorhub-input: evdev input devices on top of the poll engine.
//!
//! - [`event`]: the fixed-size kernel input record codec
//! - [`scan`]: bounded discovery of matching `/dev/input/eventN` nodes
//! - [`decoder`]: [`EventDecoder`], a `SampleProcessor` batching records by
//!   sync markers into an [`InputInterpreter`]
//! - [`rate`]: borrow-and-restore of the device's hardware poll interval
//! - [`axes`]: generic absolute-axis interpreter feeding a ring buffer

pub mod axes;
pub mod decoder;
pub mod error;
pub mod event;
pub mod rate;
pub mod scan;

pub use axes::AbsAxisInterpreter;
pub use decoder::{EventDecoder, InputInterpreter};
pub use error::InputError;
pub use event::{InputEvent, RECORD_SIZE};
pub use rate::{PollRate, poll_rate_path};
pub use scan::{DeviceIdentity, DeviceProbe, EvdevProbe, ScanConfig, scan, scan_into};
