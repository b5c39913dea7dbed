//! Fixed-layout sample records carried through the ring buffers and onto the
//! client sockets.
//!
//! Every record is written to the wire as little-endian fields in declaration
//! order, timestamp first. Clients validate the channel type from the socket
//! preamble and then read `WIRE_SIZE`-byte records back to back.

use serde::{Deserialize, Serialize};

// ─── SampleKind ─────────────────────────────────────────────────────

/// Record layout a channel produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// Single unsigned reading (ambient light, pressure, ...).
    Unsigned,
    /// Three signed axes (accelerometer, magnetometer, gyroscope).
    Xyz,
    /// Proximity distance plus a near/far flag.
    Proximity,
}

impl SampleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::Xyz => "xyz",
            Self::Proximity => "proximity",
        }
    }

    /// Size in bytes of one encoded record of this kind.
    pub fn wire_size(self) -> usize {
        match self {
            Self::Unsigned => TimedUnsigned::WIRE_SIZE,
            Self::Xyz => TimedXyz::WIRE_SIZE,
            Self::Proximity => ProximityData::WIRE_SIZE,
        }
    }
}

// ─── Sample trait ───────────────────────────────────────────────────

/// A typed sample slot.
///
/// `from_values` is the bridge used by generic producers (sysfs text parsers,
/// input axis accumulators): missing values default to zero and out-of-range
/// values saturate.
pub trait Sample: Copy + Default + Send + Sync + 'static {
    const KIND: SampleKind;
    const WIRE_SIZE: usize;

    fn timestamp_us(&self) -> u64;

    fn from_values(timestamp_us: u64, values: &[i64]) -> Self;

    /// Append the wire encoding to `out`. Always appends exactly `WIRE_SIZE` bytes.
    fn encode(&self, out: &mut Vec<u8>);
}

fn value_at(values: &[i64], idx: usize) -> i64 {
    values.get(idx).copied().unwrap_or(0)
}

fn saturate_u32(v: i64) -> u32 {
    v.clamp(0, i64::from(u32::MAX)) as u32
}

fn saturate_i32(v: i64) -> i32 {
    v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

// ─── TimedUnsigned ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimedUnsigned {
    pub timestamp_us: u64,
    pub value: u32,
}

impl Sample for TimedUnsigned {
    const KIND: SampleKind = SampleKind::Unsigned;
    const WIRE_SIZE: usize = 12;

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    fn from_values(timestamp_us: u64, values: &[i64]) -> Self {
        Self {
            timestamp_us,
            value: saturate_u32(value_at(values, 0)),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp_us.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
    }
}

// ─── TimedXyz ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimedXyz {
    pub timestamp_us: u64,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Sample for TimedXyz {
    const KIND: SampleKind = SampleKind::Xyz;
    const WIRE_SIZE: usize = 20;

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    fn from_values(timestamp_us: u64, values: &[i64]) -> Self {
        Self {
            timestamp_us,
            x: saturate_i32(value_at(values, 0)),
            y: saturate_i32(value_at(values, 1)),
            z: saturate_i32(value_at(values, 2)),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp_us.to_le_bytes());
        out.extend_from_slice(&self.x.to_le_bytes());
        out.extend_from_slice(&self.y.to_le_bytes());
        out.extend_from_slice(&self.z.to_le_bytes());
    }
}

// ─── ProximityData ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProximityData {
    pub timestamp_us: u64,
    pub value: u32,
    pub within_proximity: bool,
}

impl Sample for ProximityData {
    const KIND: SampleKind = SampleKind::Proximity;
    const WIRE_SIZE: usize = 13;

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// `values[0]` is the raw reading; `values[1]`, when present, is the
    /// near/far flag. Without a flag any non-zero reading counts as near.
    fn from_values(timestamp_us: u64, values: &[i64]) -> Self {
        let value = saturate_u32(value_at(values, 0));
        let within_proximity = match values.get(1) {
            Some(flag) => *flag != 0,
            None => value != 0,
        };
        Self {
            timestamp_us,
            value,
            within_proximity,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp_us.to_le_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.push(u8::from(self.within_proximity));
    }
}
