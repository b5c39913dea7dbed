//! Hardware channels behind one object-safe interface.
//!
//! A channel pairs a `PollEngine` with the ring buffer its processor writes
//! into. The engine and processor types differ per source kind and the sample
//! type per channel, so the rest of the daemon sees `dyn ChannelControl` and
//! reads already-encoded bytes through `dyn EncodedReader`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sensorhub_core::{
    BroadcastBuffer, BufferRegistry, ProximityData, ReadOutcome, ReaderWaker, RegistryError,
    RingReader, Sample, SampleKind, TimedUnsigned, TimedXyz,
};
use sensorhub_input::{
    AbsAxisInterpreter, EventDecoder, EvdevProbe, PollRate, poll_rate_path, scan_into,
};
use sensorhub_poll::{
    EngineStatus, PollEngine, PollError, PollMode, PowerControl, SampleProcessor, SysfsProcessor,
};
use tracing::{info, warn};

use crate::config::{ChannelConfig, InputConfig, ModeConfig};

// ─── Interfaces ─────────────────────────────────────────────────────

/// Drains a reader into wire-encoded records.
pub trait EncodedReader: Send {
    /// Append every unread record to `out`.
    fn drain(&mut self, out: &mut Vec<u8>) -> ReadOutcome;
}

pub trait ChannelControl: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> SampleKind;
    fn start(&self) -> Result<(), PollError>;
    fn stop(&self) -> Result<(), PollError>;
    fn standby(&self) -> bool;
    fn resume(&self) -> bool;
    fn set_standby_override(&self, enabled: bool);
    /// Apply an arbitrated interval. `0` means the channel's configured rate.
    fn set_interval_ms(&self, ms: u32) -> Result<(), PollError>;
    fn status(&self) -> EngineStatus;
    /// Attach a reader to the channel's buffer; `waker` fires on each commit.
    fn join(&self, waker: ReaderWaker) -> Result<Box<dyn EncodedReader>, RegistryError>;
}

// ─── Generic implementation ─────────────────────────────────────────

struct SampleReader<S: Sample> {
    reader: RingReader<S>,
    scratch: Vec<S>,
}

impl<S: Sample> EncodedReader for SampleReader<S> {
    fn drain(&mut self, out: &mut Vec<u8>) -> ReadOutcome {
        self.scratch.clear();
        let outcome = self.reader.read(&mut self.scratch);
        for sample in &self.scratch {
            sample.encode(out);
        }
        outcome
    }
}

/// Hook applying a non-zero interval to the processor (e.g. the input
/// device's hardware poll rate) when the engine itself has no interval.
type RateHook<P> = fn(&mut P, u32);

pub struct Channel<S: Sample, P: SampleProcessor> {
    engine: PollEngine<P>,
    registry: Arc<BufferRegistry>,
    rate_hook: Option<RateHook<P>>,
    /// Rate restored through `rate_hook` once no session votes; 0 for none.
    default_rate_ms: u32,
    _sample: std::marker::PhantomData<fn() -> S>,
}

impl<S: Sample, P: SampleProcessor> Channel<S, P> {
    fn new(engine: PollEngine<P>, registry: Arc<BufferRegistry>) -> Self {
        Self {
            engine,
            registry,
            rate_hook: None,
            default_rate_ms: 0,
            _sample: std::marker::PhantomData,
        }
    }
}

impl<S: Sample, P: SampleProcessor> ChannelControl for Channel<S, P> {
    fn name(&self) -> &str {
        self.engine.name()
    }

    fn kind(&self) -> SampleKind {
        S::KIND
    }

    fn start(&self) -> Result<(), PollError> {
        self.engine.start(self.engine.name())
    }

    fn stop(&self) -> Result<(), PollError> {
        self.engine.stop(self.engine.name())
    }

    fn standby(&self) -> bool {
        self.engine.standby()
    }

    fn resume(&self) -> bool {
        self.engine.resume()
    }

    fn set_standby_override(&self, enabled: bool) {
        self.engine.set_standby_override(enabled);
    }

    fn set_interval_ms(&self, ms: u32) -> Result<(), PollError> {
        match (self.engine.mode(), self.rate_hook) {
            (PollMode::Interval { default }, _) => {
                let interval = if ms == 0 {
                    default
                } else {
                    Duration::from_millis(u64::from(ms))
                };
                self.engine.set_interval(interval)
            }
            (PollMode::Interrupt, Some(hook)) => {
                let target = if ms == 0 { self.default_rate_ms } else { ms };
                if target > 0 {
                    self.engine.with_processor(|p| hook(p, target));
                }
                Ok(())
            }
            // Interrupt channels already deliver at the hardware rate.
            (PollMode::Interrupt, _) => Ok(()),
        }
    }

    fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    fn join(&self, waker: ReaderWaker) -> Result<Box<dyn EncodedReader>, RegistryError> {
        let buffer = self.registry.find_buffer::<S>(self.engine.name())?;
        Ok(Box::new(SampleReader {
            reader: buffer.join_with_waker(waker),
            scratch: Vec::new(),
        }))
    }
}

// ─── Construction ───────────────────────────────────────────────────

/// Build a channel from its configuration and register its buffer.
pub fn build(
    config: &ChannelConfig,
    registry: &Arc<BufferRegistry>,
) -> anyhow::Result<Arc<dyn ChannelControl>> {
    match config.sample {
        SampleKind::Unsigned => build_typed::<TimedUnsigned>(config, registry),
        SampleKind::Xyz => build_typed::<TimedXyz>(config, registry),
        SampleKind::Proximity => build_typed::<ProximityData>(config, registry),
    }
}

fn build_typed<S: Sample>(
    config: &ChannelConfig,
    registry: &Arc<BufferRegistry>,
) -> anyhow::Result<Arc<dyn ChannelControl>> {
    let buffer = BroadcastBuffer::<S>::new(config.buffer_capacity);
    let writer = buffer
        .take_writer()
        .context("fresh buffer has no writer")?;
    registry
        .register(&config.name, buffer)
        .with_context(|| format!("cannot register buffer for {:?}", config.name))?;

    let channel: Arc<dyn ChannelControl> = match &config.input {
        Some(input) => {
            let decoder = build_decoder(input, S::KIND, writer);
            let engine = with_common(
                PollEngine::new(&config.name, PollMode::Interrupt, decoder),
                config,
            )?;
            if let Err(e) = scan_into(&engine, &input.scan_config(), EvdevProbe) {
                warn!(channel = %config.name, error = %e, "channel has no device");
            }
            for path in engine.source_paths() {
                attach_poll_rate(&engine, input, &path);
            }
            let mut channel = Channel::<S, _>::new(engine, Arc::clone(registry));
            channel.rate_hook = Some(apply_poll_rate::<S>);
            channel.default_rate_ms = input.poll_rate_ms.unwrap_or(0);
            Arc::new(channel)
        }
        None => {
            let mode = match config.mode {
                ModeConfig::Interrupt => PollMode::Interrupt,
                ModeConfig::Interval => PollMode::Interval {
                    default: Duration::from_millis(u64::from(config.default_interval_ms)),
                },
            };
            let engine = with_common(
                PollEngine::new(&config.name, mode, SysfsProcessor::new(writer)),
                config,
            )?;
            for (id, path) in config.paths.iter().enumerate() {
                if !engine.add_source(path, id as u32) {
                    warn!(channel = %config.name, path = %path.display(), "skipping missing source");
                }
            }
            Arc::new(Channel::<S, _>::new(engine, Arc::clone(registry)))
        }
    };

    info!(
        channel = %config.name,
        sample = S::KIND.as_str(),
        sources = channel.status().sources.len(),
        "channel ready"
    );
    Ok(channel)
}

fn build_decoder<S: Sample>(
    input: &InputConfig,
    kind: SampleKind,
    writer: sensorhub_core::RingWriter<S>,
) -> EventDecoder<AbsAxisInterpreter<S>> {
    EventDecoder::new(AbsAxisInterpreter::new(input.axes_for(kind), writer))
}

fn attach_poll_rate<S: Sample>(
    engine: &PollEngine<EventDecoder<AbsAxisInterpreter<S>>>,
    input: &InputConfig,
    device: &Path,
) {
    let Some(target_ms) = input.poll_rate_ms else {
        return;
    };
    let Some(control) = poll_rate_path(device, &input.sysfs_root) else {
        return;
    };
    engine.with_processor(|decoder| decoder.add_poll_rate(PollRate::new(control, target_ms)));
}

fn apply_poll_rate<S: Sample>(decoder: &mut EventDecoder<AbsAxisInterpreter<S>>, ms: u32) {
    decoder.set_poll_rate_ms(ms);
}

fn with_common<P: SampleProcessor>(
    engine: PollEngine<P>,
    config: &ChannelConfig,
) -> anyhow::Result<PollEngine<P>> {
    engine
        .add_channel(&config.name)
        .with_context(|| format!("cannot adapt channel {:?}", config.name))?;
    if config.standby_override {
        engine.set_standby_override(true);
    }
    Ok(match &config.power_control {
        Some(path) => engine.with_power_control(PowerControl::new(path)),
        None => engine,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_channel(control: &Path, rate_ms: u32) -> Channel<TimedXyz, EventDecoder<AbsAxisInterpreter<TimedXyz>>> {
        let buffer = BroadcastBuffer::<TimedXyz>::new(8);
        let writer = buffer.take_writer().expect("writer");
        let registry = Arc::new(BufferRegistry::new());
        registry.register("accel", buffer).expect("register");

        let mut decoder = EventDecoder::new(AbsAxisInterpreter::new(vec![0, 1, 2], writer));
        decoder.add_poll_rate(PollRate::new(control, rate_ms));
        let mut channel = Channel::new(PollEngine::new("accel", PollMode::Interrupt, decoder), registry);
        channel.rate_hook = Some(apply_poll_rate::<TimedXyz>);
        channel.default_rate_ms = rate_ms;
        channel
    }

    #[test]
    fn withdrawn_votes_restore_configured_poll_rate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = dir.path().join("poll");
        std::fs::write(&control, "8").expect("seed");
        let channel = input_channel(&control, 50);

        channel.set_interval_ms(10).expect("vote");
        channel.set_interval_ms(0).expect("withdraw");

        channel.engine.with_processor(SampleProcessor::on_engage);
        assert_eq!(std::fs::read_to_string(&control).expect("read"), "50");
        channel.engine.with_processor(SampleProcessor::on_release);
        assert_eq!(std::fs::read_to_string(&control).expect("read"), "8");
    }

    #[test]
    fn positive_vote_drives_engaged_poll_rate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let control = dir.path().join("poll");
        std::fs::write(&control, "8").expect("seed");
        let channel = input_channel(&control, 50);

        channel.engine.with_processor(SampleProcessor::on_engage);
        channel.set_interval_ms(10).expect("vote");
        assert_eq!(std::fs::read_to_string(&control).expect("read"), "10");
        channel.set_interval_ms(0).expect("withdraw");
        assert_eq!(std::fs::read_to_string(&control).expect("read"), "50");
        channel.engine.with_processor(SampleProcessor::on_release);
    }
}
