//! Textual sysfs attributes: value parsing and a generic processor that turns
//! each read into one sample.

use std::fs::File;
use std::io::Read;

use sensorhub_core::{RingWriter, Sample, monotonic_us};
use tracing::warn;

use crate::engine::SampleProcessor;

/// Longest attribute content read per tick.
const MAX_ATTR_LEN: usize = 256;

/// Parse the numbers out of a sysfs attribute.
///
/// Accepts plain values (`"412\n"`), parenthesised tuples (`"(12,-3,980)"`),
/// colon separated tuples (`"12:-3:980"`) and whitespace separated lists.
/// Tokens that are not integers are skipped.
pub fn parse_sysfs_values(text: &str) -> Vec<i64> {
    text.trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(|c: char| c == ',' || c == ':' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .filter_map(|t| t.parse::<i64>().ok())
        .collect()
}

/// Reads a sysfs attribute per tick and publishes one `S` into the channel's
/// ring buffer.
pub struct SysfsProcessor<S: Sample> {
    writer: RingWriter<S>,
}

impl<S: Sample> SysfsProcessor<S> {
    pub fn new(writer: RingWriter<S>) -> Self {
        Self { writer }
    }
}

impl<S: Sample> SampleProcessor for SysfsProcessor<S> {
    fn process_sample(&mut self, id: u32, file: &mut File) -> std::io::Result<()> {
        let mut buf = [0u8; MAX_ATTR_LEN];
        let n = file.read(&mut buf)?;
        let text = String::from_utf8_lossy(&buf[..n]);
        let values = parse_sysfs_values(&text);
        if values.is_empty() {
            warn!(source = id, content = %text.trim(), "attribute holds no numeric value");
            return Ok(());
        }

        *self.writer.next_slot() = S::from_values(monotonic_us(), &values);
        self.writer.commit();
        self.writer.wake_up_readers();
        Ok(())
    }
}
