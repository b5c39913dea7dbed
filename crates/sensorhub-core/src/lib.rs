//! sensorhub-core: in-process data distribution for the sensor hub.
//! Sample records, the single-writer/multi-reader ring buffer, named buffer
//! lookup and interval arbitration. No I/O, no threads.

pub mod clock;
pub mod interval;
pub mod registry;
pub mod ring;
pub mod sample;

/// Client session identifier, as sent in the 4-byte socket handshake.
pub type SessionId = i32;

pub use clock::monotonic_us;
pub use interval::IntervalArbiter;
pub use registry::{BufferRegistry, RegistryError};
pub use ring::{BroadcastBuffer, ReadOutcome, ReaderWaker, RingReader, RingWriter};
pub use sample::{ProximityData, Sample, SampleKind, TimedUnsigned, TimedXyz};
