//! Absolute-axis interpreter: latches the configured `EV_ABS` codes and
//! publishes one sample per sync marker.

use std::collections::BTreeMap;

use sensorhub_core::{RingWriter, Sample, monotonic_us};

use crate::decoder::InputInterpreter;
use crate::event::{EV_ABS, InputEvent};

#[derive(Debug, Clone, Default)]
struct AxisState {
    /// Latest value per configured code; evdev only reports changes.
    values: Vec<i64>,
    dirty: bool,
}

pub struct AbsAxisInterpreter<S: Sample> {
    codes: Vec<u16>,
    states: BTreeMap<u32, AxisState>,
    writer: RingWriter<S>,
}

impl<S: Sample> AbsAxisInterpreter<S> {
    /// `codes` maps to `Sample::from_values` positions in order.
    pub fn new(codes: Vec<u16>, writer: RingWriter<S>) -> Self {
        Self {
            codes,
            states: BTreeMap::new(),
            writer,
        }
    }

    fn state(&mut self, source: u32) -> &mut AxisState {
        let width = self.codes.len();
        self.states.entry(source).or_insert_with(|| AxisState {
            values: vec![0; width],
            dirty: false,
        })
    }
}

impl<S: Sample> InputInterpreter for AbsAxisInterpreter<S> {
    fn interpret(&mut self, source: u32, event: &InputEvent) {
        if event.kind != EV_ABS {
            return;
        }
        let Some(pos) = self.codes.iter().position(|c| *c == event.code) else {
            return;
        };
        let state = self.state(source);
        state.values[pos] = i64::from(event.value);
        state.dirty = true;
    }

    fn commit(&mut self, source: u32, _event: &InputEvent) {
        let state = self.state(source);
        if !state.dirty {
            return;
        }
        state.dirty = false;
        let sample = S::from_values(monotonic_us(), &state.values);

        *self.writer.next_slot() = sample;
        self.writer.commit();
        self.writer.wake_up_readers();
    }
}
