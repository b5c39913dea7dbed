//! [`EventDecoder`]: turns raw input record reads into per-field callbacks and
//! per-batch commits.

use std::fs::File;
use std::io::Read;

use sensorhub_poll::SampleProcessor;
use tracing::{trace, warn};

use crate::event::{InputEvent, RECORD_SIZE, decode_batch};
use crate::rate::PollRate;

/// Records read per readiness at most.
pub const MAX_BATCH: usize = 64;

/// Channel-specific interpretation of decoded records.
pub trait InputInterpreter: Send + 'static {
    /// Accumulate one non-sync record from `source`.
    fn interpret(&mut self, source: u32, event: &InputEvent);

    /// A sync marker closed the batch from `source`.
    fn commit(&mut self, source: u32, event: &InputEvent);
}

pub struct EventDecoder<I> {
    interpreter: I,
    rates: Vec<PollRate>,
    buf: Vec<u8>,
}

impl<I: InputInterpreter> EventDecoder<I> {
    pub fn new(interpreter: I) -> Self {
        Self {
            interpreter,
            rates: Vec::new(),
            buf: vec![0; MAX_BATCH * RECORD_SIZE],
        }
    }

    /// Couple a device's hardware poll interval to this decoder's engagement.
    pub fn add_poll_rate(&mut self, rate: PollRate) {
        self.rates.push(rate);
    }

    /// Retarget every coupled device; installed ones change immediately.
    pub fn set_poll_rate_ms(&mut self, ms: u32) {
        for rate in &mut self.rates {
            if let Err(e) = rate.set_target(ms) {
                warn!(error = %e, "failed to change poll rate");
            }
        }
    }

    /// Dispatch every whole record in `bytes`. Returns the number of records.
    pub fn feed(&mut self, source: u32, bytes: &[u8]) -> usize {
        let (events, remainder) = decode_batch(bytes);
        if remainder != 0 {
            warn!(
                source,
                bytes = bytes.len(),
                discarded = remainder,
                "protocol anomaly: partial input record"
            );
        }
        for event in &events {
            if event.is_sync() {
                self.interpreter.commit(source, event);
            } else {
                self.interpreter.interpret(source, event);
            }
        }
        events.len()
    }
}

impl<I: InputInterpreter> SampleProcessor for EventDecoder<I> {
    fn process_sample(&mut self, id: u32, file: &mut File) -> std::io::Result<()> {
        let mut buf = std::mem::take(&mut self.buf);
        let result = file.read(&mut buf);
        let outcome = result.map(|n| {
            let records = self.feed(id, &buf[..n]);
            trace!(source = id, records, "decoded");
        });
        self.buf = buf;
        outcome
    }

    fn on_engage(&mut self) {
        for rate in &mut self.rates {
            if let Err(e) = rate.install() {
                warn!(error = %e, "failed to install poll rate");
            }
        }
    }

    fn on_release(&mut self) {
        for rate in &mut self.rates {
            if let Err(e) = rate.restore() {
                warn!(error = %e, "failed to restore poll rate");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ABS_X, ABS_Y, EV_ABS, EV_SYN, SYN_REPORT};
    use std::io::{Seek, Write};

    #[derive(Default)]
    struct Recorder {
        interpreted: Vec<(u32, u16, i32)>,
        commits: Vec<u32>,
    }

    impl InputInterpreter for Recorder {
        fn interpret(&mut self, source: u32, event: &InputEvent) {
            self.interpreted.push((source, event.code, event.value));
        }

        fn commit(&mut self, source: u32, _event: &InputEvent) {
            self.commits.push(source);
        }
    }

    fn batch(events: &[InputEvent]) -> Vec<u8> {
        events.iter().flat_map(InputEvent::encode).collect()
    }

    #[test]
    fn sync_markers_split_batches() {
        let mut decoder = EventDecoder::new(Recorder::default());
        let bytes = batch(&[
            InputEvent::new(1, EV_ABS, ABS_X, 10),
            InputEvent::new(1, EV_ABS, ABS_Y, -4),
            InputEvent::new(1, EV_SYN, SYN_REPORT, 0),
            InputEvent::new(2, EV_ABS, ABS_X, 11),
            InputEvent::new(2, EV_SYN, SYN_REPORT, 0),
        ]);

        assert_eq!(decoder.feed(7, &bytes), 5);
        let rec = &decoder.interpreter;
        assert_eq!(rec.interpreted, vec![(7, ABS_X, 10), (7, ABS_Y, -4), (7, ABS_X, 11)]);
        assert_eq!(rec.commits, vec![7, 7]);
    }

    #[test]
    fn misaligned_tail_is_discarded() {
        let mut decoder = EventDecoder::new(Recorder::default());
        let mut bytes = batch(&[
            InputEvent::new(1, EV_ABS, ABS_X, 1),
            InputEvent::new(1, EV_SYN, SYN_REPORT, 0),
        ]);
        bytes.extend([0u8; 3]);

        assert_eq!(decoder.feed(0, &bytes), 2);
        assert_eq!(decoder.interpreter.commits.len(), 1);

        // Nothing carried over to the next read.
        assert_eq!(decoder.feed(0, &[0u8; 5]), 0);
        assert_eq!(decoder.interpreter.interpreted.len(), 1);
    }

    #[test]
    fn process_sample_reads_from_file() {
        let mut decoder = EventDecoder::new(Recorder::default());
        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(&batch(&[
            InputEvent::new(5, EV_ABS, ABS_Y, 99),
            InputEvent::new(5, EV_SYN, SYN_REPORT, 0),
        ]))
        .expect("write");
        file.rewind().expect("rewind");

        decoder.process_sample(2, &mut file).expect("process");
        assert_eq!(decoder.interpreter.interpreted, vec![(2, ABS_Y, 99)]);
        assert_eq!(decoder.interpreter.commits, vec![2]);
    }

    #[test]
    fn engagement_drives_poll_rate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = dir.path().join("poll");
        std::fs::write(&control, "200").expect("seed");

        let mut decoder = EventDecoder::new(Recorder::default());
        decoder.add_poll_rate(PollRate::new(&control, 20));
        decoder.on_engage();
        assert_eq!(std::fs::read_to_string(&control).expect("read"), "20");
        decoder.set_poll_rate_ms(40);
        assert_eq!(std::fs::read_to_string(&control).expect("read"), "40");
        decoder.on_release();
        assert_eq!(std::fs::read_to_string(&control).expect("read"), "200");
    }
}
