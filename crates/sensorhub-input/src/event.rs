//! Kernel input event records (`struct input_event`).

use std::mem::size_of;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_REL: u16 = 0x02;
pub const EV_ABS: u16 = 0x03;

pub const SYN_REPORT: u16 = 0x00;

pub const ABS_X: u16 = 0x00;
pub const ABS_Y: u16 = 0x01;
pub const ABS_Z: u16 = 0x02;
pub const ABS_DISTANCE: u16 = 0x19;
pub const ABS_MISC: u16 = 0x28;

/// Size in bytes of one record as the kernel writes it.
pub const RECORD_SIZE: usize = size_of::<libc::input_event>();

/// One decoded input record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    /// Kernel timestamp in microseconds.
    pub timestamp_us: u64,
    pub kind: u16,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn new(timestamp_us: u64, kind: u16, code: u16, value: i32) -> Self {
        Self {
            timestamp_us,
            kind,
            code,
            value,
        }
    }

    /// Synchronization marker closing a batch of related events.
    pub fn is_sync(&self) -> bool {
        self.kind == EV_SYN
    }

    /// Decode one record. `None` unless `record` is exactly `RECORD_SIZE` bytes.
    pub fn decode(record: &[u8]) -> Option<Self> {
        if record.len() != RECORD_SIZE {
            return None;
        }
        // SAFETY: the slice holds exactly size_of::<input_event>() bytes and
        // input_event is plain old data valid for any bit pattern.
        let raw: libc::input_event =
            unsafe { std::ptr::read_unaligned(record.as_ptr().cast::<libc::input_event>()) };

        let secs = u64::try_from(raw.time.tv_sec).unwrap_or(0);
        let micros = u64::try_from(raw.time.tv_usec).unwrap_or(0);
        Some(Self {
            timestamp_us: secs.saturating_mul(1_000_000).saturating_add(micros),
            kind: raw.type_,
            code: raw.code,
            value: raw.value,
        })
    }

    /// Encode in the kernel layout; used to feed fake devices.
    pub fn encode(&self) -> Vec<u8> {
        let raw = libc::input_event {
            time: libc::timeval {
                tv_sec: (self.timestamp_us / 1_000_000) as libc::time_t,
                tv_usec: (self.timestamp_us % 1_000_000) as libc::suseconds_t,
            },
            type_: self.kind,
            code: self.code,
            value: self.value,
        };
        // SAFETY: `raw` is a live, fully initialised input_event without
        // padding; viewing it as RECORD_SIZE bytes is sound.
        let bytes = unsafe {
            std::slice::from_raw_parts((&raw as *const libc::input_event).cast::<u8>(), RECORD_SIZE)
        };
        bytes.to_vec()
    }
}

/// Decode every whole record in `bytes`. Returns the events and the number of
/// trailing bytes that did not form a whole record.
pub fn decode_batch(bytes: &[u8]) -> (Vec<InputEvent>, usize) {
    let chunks = bytes.chunks_exact(RECORD_SIZE);
    let remainder = chunks.remainder().len();
    let events = chunks.filter_map(InputEvent::decode).collect();
    (events, remainder)
}
