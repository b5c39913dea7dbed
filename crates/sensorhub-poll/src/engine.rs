//! PollEngine: reference-counted, standby-aware owner of one hardware
//! channel's descriptors and worker thread.
//!
//! Locking: the controller takes `control` first and `shared` second; the
//! worker only ever takes `shared`. The controller never holds `shared`
//! while joining the worker.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::PollError;
use crate::power::PowerControl;
use crate::source::{self, WatchedSource};
use crate::worker::Worker;

// ─── Processor capability ───────────────────────────────────────────

/// Per-readiness behaviour injected into an engine.
pub trait SampleProcessor: Send + 'static {
    /// Called once per readiness (Interrupt) or tick (Interval) for the
    /// source registered with `id`. The file is rewound afterwards.
    ///
    /// Errors are logged by the worker and the tick is skipped.
    fn process_sample(&mut self, id: u32, file: &mut File) -> std::io::Result<()>;

    /// Descriptors were just opened; the worker has not started yet.
    fn on_engage(&mut self) {}

    /// The worker has exited; descriptors are about to be closed.
    fn on_release(&mut self) {}
}

// ─── Types ──────────────────────────────────────────────────────────

/// Worker strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Block in `poll(2)` until a descriptor reports new content.
    Interrupt,
    /// Read every descriptor, then sleep `default` (or the arbitrated value).
    Interval { default: Duration },
}

impl PollMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Interval { .. } => "interval",
        }
    }
}

/// Named output endpoint with its own reference count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdaptedChannel {
    pub name: String,
    pub ref_count: u32,
    /// True while the channel is referenced and the hardware is engaged.
    pub running: bool,
}

/// Desired vs. actual hardware engagement across display-blank standby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StandbyState {
    pub in_standby: bool,
    /// Standby was requested and not yet resumed, even if the override kept
    /// the hardware up.
    pub standby_requested: bool,
    pub standby_override: bool,
    pub should_be_running: bool,
}

/// Point-in-time view of an engine for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub mode: &'static str,
    pub interval_ms: Option<u64>,
    pub worker_running: bool,
    pub sources: Vec<PathBuf>,
    pub standby: StandbyState,
    pub channels: Vec<AdaptedChannel>,
}

// ─── Internal ───────────────────────────────────────────────────────

/// State shared between controller and worker, guarded by one lock.
pub(crate) struct Shared<P> {
    pub(crate) sources: Vec<WatchedSource>,
    pub(crate) processor: P,
}

struct Control {
    channels: Vec<AdaptedChannel>,
    standby: StandbyState,
    worker: Option<Worker>,
}

impl Control {
    fn total_refs(&self) -> u32 {
        self.channels.iter().map(|c| c.ref_count).sum()
    }

    fn channel_mut(&mut self, name: &str) -> Option<&mut AdaptedChannel> {
        self.channels.iter_mut().find(|c| c.name == name)
    }

    fn sync_running(&mut self) {
        let engaged = self.worker.is_some();
        for ch in &mut self.channels {
            ch.running = engaged && ch.ref_count > 0;
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── PollEngine ─────────────────────────────────────────────────────

pub struct PollEngine<P> {
    name: String,
    mode: PollMode,
    /// Current sleep for Interval mode; unused in Interrupt mode.
    interval_ms: Arc<AtomicU64>,
    shared: Arc<Mutex<Shared<P>>>,
    control: Mutex<Control>,
    power: Option<PowerControl>,
}

impl<P: SampleProcessor> PollEngine<P> {
    pub fn new(name: impl Into<String>, mode: PollMode, processor: P) -> Self {
        let interval_ms = match mode {
            PollMode::Interval { default } => duration_ms(default),
            PollMode::Interrupt => 0,
        };
        Self {
            name: name.into(),
            mode,
            interval_ms: Arc::new(AtomicU64::new(interval_ms)),
            shared: Arc::new(Mutex::new(Shared {
                sources: Vec::new(),
                processor,
            })),
            control: Mutex::new(Control {
                channels: Vec::new(),
                standby: StandbyState::default(),
                worker: None,
            }),
            power: None,
        }
    }

    /// Write `"1"`/`"0"` to `power` whenever the hardware is engaged/released.
    #[must_use]
    pub fn with_power_control(mut self, power: PowerControl) -> Self {
        self.power = Some(power);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    /// Register an output channel name that consumers start and stop.
    pub fn add_channel(&self, name: &str) -> Result<(), PollError> {
        let mut control = lock(&self.control);
        if control.channels.iter().any(|c| c.name == name) {
            return Err(PollError::DuplicateChannel(name.to_string()));
        }
        control.channels.push(AdaptedChannel {
            name: name.to_string(),
            ref_count: 0,
            running: false,
        });
        Ok(())
    }

    /// Register a file to monitor. Returns `false` if the path does not exist.
    /// Sources added while engaged are picked up on the next engage.
    pub fn add_source(&self, path: impl AsRef<Path>, id: u32) -> bool {
        let path = path.as_ref();
        if !path.exists() {
            warn!(engine = %self.name, path = %path.display(), "source does not exist");
            return false;
        }
        lock(&self.shared)
            .sources
            .push(WatchedSource::new(path, id));
        debug!(engine = %self.name, path = %path.display(), id, "source added");
        true
    }

    pub fn source_paths(&self) -> Vec<PathBuf> {
        lock(&self.shared)
            .sources
            .iter()
            .map(|s| s.path().to_path_buf())
            .collect()
    }

    /// Number of currently open descriptors.
    pub fn open_count(&self) -> usize {
        lock(&self.shared)
            .sources
            .iter()
            .filter(|s| s.is_open())
            .count()
    }

    /// Run `f` with exclusive access to the processor.
    pub fn with_processor<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut lock(&self.shared).processor)
    }

    // ── Reference counting ──────────────────────────────────────────

    /// Take a reference on `channel`. The first reference across all
    /// channels opens the sources and starts the worker, unless the engine is
    /// in standby, in which case only the intent is recorded.
    pub fn start(&self, channel: &str) -> Result<(), PollError> {
        let mut control = lock(&self.control);
        let total_before = control.total_refs();
        let ch = control
            .channel_mut(channel)
            .ok_or_else(|| PollError::UnknownChannel(channel.to_string()))?;
        ch.ref_count += 1;
        debug!(engine = %self.name, channel, ref_count = ch.ref_count, "start");

        if total_before > 0 {
            control.sync_running();
            return Ok(());
        }

        control.standby.should_be_running = true;
        if control.standby.in_standby && !control.standby.standby_override {
            info!(engine = %self.name, channel, "in standby, deferring hardware start");
            return Ok(());
        }

        if let Err(e) = self.engage(&mut control) {
            error!(engine = %self.name, channel, error = %e, "start failed");
            control.standby.should_be_running = false;
            if let Some(ch) = control.channel_mut(channel) {
                ch.ref_count -= 1;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Release a reference on `channel`. The last reference stops the worker
    /// and closes the sources.
    pub fn stop(&self, channel: &str) -> Result<(), PollError> {
        let mut control = lock(&self.control);
        let ch = control
            .channel_mut(channel)
            .ok_or_else(|| PollError::UnknownChannel(channel.to_string()))?;
        if ch.ref_count == 0 {
            warn!(engine = %self.name, channel, "stop without matching start");
            return Ok(());
        }
        ch.ref_count -= 1;
        debug!(engine = %self.name, channel, ref_count = ch.ref_count, "stop");

        if control.total_refs() == 0 {
            control.standby.should_be_running = false;
            self.release(&mut control);
        } else {
            control.sync_running();
        }
        Ok(())
    }

    pub fn ref_count(&self, channel: &str) -> Option<u32> {
        lock(&self.control)
            .channels
            .iter()
            .find(|c| c.name == channel)
            .map(|c| c.ref_count)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).worker.is_some()
    }

    // ── Standby ─────────────────────────────────────────────────────

    /// Release the hardware without touching reference counts or intent.
    /// Returns `true` if the engine entered standby on this call.
    pub fn standby(&self) -> bool {
        let mut control = lock(&self.control);
        if control.standby.in_standby {
            return false;
        }
        control.standby.standby_requested = true;
        if control.standby.standby_override {
            debug!(engine = %self.name, "standby override set, staying up");
            return false;
        }
        self.enter_standby_locked(&mut control);
        true
    }

    fn enter_standby_locked(&self, control: &mut Control) {
        control.standby.in_standby = true;
        self.release(control);
        info!(engine = %self.name, "entered standby");
    }

    /// Leave standby, re-engaging the hardware if any reference wants it.
    /// Returns `true` if the engine was in standby.
    pub fn resume(&self) -> bool {
        let mut control = lock(&self.control);
        control.standby.standby_requested = false;
        self.resume_locked(&mut control)
    }

    fn resume_locked(&self, control: &mut Control) -> bool {
        if !control.standby.in_standby {
            return false;
        }
        control.standby.in_standby = false;
        if control.standby.should_be_running
            && control.worker.is_none()
            && let Err(e) = self.engage(control)
        {
            error!(engine = %self.name, error = %e, "resume failed");
        }
        info!(engine = %self.name, "resumed from standby");
        true
    }

    /// Keep the hardware engaged through standby. Setting the override while
    /// already in standby resumes immediately; clearing it while standby is
    /// still requested releases the hardware.
    pub fn set_standby_override(&self, enabled: bool) {
        let mut control = lock(&self.control);
        control.standby.standby_override = enabled;
        if enabled {
            self.resume_locked(&mut control);
        } else if control.standby.standby_requested && !control.standby.in_standby {
            self.enter_standby_locked(&mut control);
        }
    }

    pub fn standby_state(&self) -> StandbyState {
        lock(&self.control).standby
    }

    // ── Interval ────────────────────────────────────────────────────

    /// Current worker sleep; `None` in Interrupt mode.
    pub fn interval(&self) -> Option<Duration> {
        match self.mode {
            PollMode::Interval { .. } => Some(Duration::from_millis(
                self.interval_ms.load(Ordering::Relaxed),
            )),
            PollMode::Interrupt => None,
        }
    }

    /// Change the sleep between ticks. Takes effect after the current sleep.
    pub fn set_interval(&self, interval: Duration) -> Result<(), PollError> {
        match self.mode {
            PollMode::Interval { .. } => {
                let ms = duration_ms(interval).max(1);
                self.interval_ms.store(ms, Ordering::Relaxed);
                debug!(engine = %self.name, interval_ms = ms, "interval changed");
                Ok(())
            }
            PollMode::Interrupt => Err(PollError::NotIntervalMode(self.name.clone())),
        }
    }

    pub fn status(&self) -> EngineStatus {
        let control = lock(&self.control);
        EngineStatus {
            name: self.name.clone(),
            mode: self.mode.as_str(),
            interval_ms: self.interval().map(|d| duration_ms(d)),
            worker_running: control.worker.is_some(),
            sources: self.source_paths(),
            standby: control.standby,
            channels: control.channels.clone(),
        }
    }

    // ── Hardware engagement ─────────────────────────────────────────

    fn engage(&self, control: &mut Control) -> Result<(), PollError> {
        {
            let mut shared = lock(&self.shared);
            if shared.sources.is_empty() {
                return Err(PollError::NoSources(self.name.clone()));
            }
            source::open_all(&mut shared.sources)?;
            shared.processor.on_engage();
        }

        if let Some(power) = &self.power
            && let Err(e) = power.set(true)
        {
            warn!(engine = %self.name, path = %power.path().display(), error = %e, "power on failed");
        }

        let spawned = match self.mode {
            PollMode::Interrupt => Worker::spawn_interrupt(&self.name, Arc::clone(&self.shared)),
            PollMode::Interval { .. } => Worker::spawn_interval(
                &self.name,
                Arc::clone(&self.shared),
                Arc::clone(&self.interval_ms),
            ),
        };
        match spawned {
            Ok(worker) => {
                control.worker = Some(worker);
                control.sync_running();
                info!(engine = %self.name, mode = self.mode.as_str(), "hardware engaged");
                Ok(())
            }
            Err(e) => {
                self.close_sources();
                Err(e)
            }
        }
    }

    fn release(&self, control: &mut Control) {
        let Some(worker) = control.worker.take() else {
            control.sync_running();
            return;
        };
        if worker.stop() {
            self.close_sources();
        } else {
            // A detached worker may still be polling these descriptors.
            let leaked = source::leak_all(&mut lock(&self.shared).sources);
            warn!(engine = %self.name, descriptors = leaked.len(), "worker detached, leaving sources open");
        }
        control.sync_running();
        info!(engine = %self.name, "hardware released");
    }

    fn close_sources(&self) {
        {
            let mut shared = lock(&self.shared);
            shared.processor.on_release();
            source::close_all(&mut shared.sources);
        }
        if let Some(power) = &self.power
            && let Err(e) = power.set(false)
        {
            warn!(engine = %self.name, path = %power.path().display(), error = %e, "power off failed");
        }
    }
}

impl<P> Drop for PollEngine<P> {
    fn drop(&mut self) {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = control.worker.take() {
            worker.stop();
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct Counters {
        samples: Arc<AtomicUsize>,
        engaged: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        bytes: Arc<Mutex<Vec<u8>>>,
    }

    struct Recorder(Counters);

    impl SampleProcessor for Recorder {
        fn process_sample(&mut self, _id: u32, file: &mut File) -> std::io::Result<()> {
            let mut buf = [0u8; 64];
            let n = file.read(&mut buf)?;
            lock(&self.0.bytes).extend_from_slice(&buf[..n]);
            self.0.samples.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_engage(&mut self) {
            self.0.engaged.fetch_add(1, Ordering::SeqCst);
        }

        fn on_release(&mut self) {
            self.0.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn interval_engine(dir: &Path, counters: &Counters) -> PollEngine<Recorder> {
        let path = dir.join("in_illuminance_raw");
        std::fs::write(&path, "42\n").expect("write source");
        let engine = PollEngine::new(
            "als",
            PollMode::Interval {
                default: Duration::from_millis(5),
            },
            Recorder(counters.clone()),
        );
        engine.add_channel("als").expect("channel");
        assert!(engine.add_source(&path, 0));
        engine
    }

    #[test]
    fn add_source_rejects_missing_path() {
        let engine = PollEngine::new("x", PollMode::Interrupt, Recorder(Counters::default()));
        assert!(!engine.add_source("/nonexistent/sensorhub/source", 0));
        assert!(engine.source_paths().is_empty());
    }

    #[test]
    fn matched_start_stop_pairs_restore_refcount() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);

        for _ in 0..5 {
            engine.start("als").expect("start");
        }
        assert_eq!(engine.ref_count("als"), Some(5));
        assert!(engine.is_running());
        for _ in 0..5 {
            engine.stop("als").expect("stop");
        }
        assert_eq!(engine.ref_count("als"), Some(0));
        assert!(!engine.is_running());
        assert_eq!(engine.open_count(), 0);
        assert_eq!(counters.engaged.load(Ordering::SeqCst), 1, "engaged only on 0->1");
        assert_eq!(counters.released.load(Ordering::SeqCst), 1, "released only on 1->0");
    }

    #[test]
    fn interval_worker_rereads_from_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);

        engine.start("als").expect("start");
        assert!(wait_until(Duration::from_secs(5), || {
            counters.samples.load(Ordering::SeqCst) >= 3
        }));
        engine.stop("als").expect("stop");

        let bytes = lock(&counters.bytes).clone();
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.starts_with("42\n42\n42\n"), "rewound each tick: {text:?}");
    }

    #[test]
    fn stop_is_synchronous() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);
        engine
            .set_interval(Duration::from_secs(30))
            .expect("interval mode");

        engine.start("als").expect("start");
        assert!(wait_until(Duration::from_secs(5), || {
            counters.samples.load(Ordering::SeqCst) >= 1
        }));
        let begun = Instant::now();
        engine.stop("als").expect("stop");
        assert!(begun.elapsed() < Duration::from_secs(5), "stop did not wait out the interval");

        let after_stop = counters.samples.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counters.samples.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn unknown_channel_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = interval_engine(dir.path(), &Counters::default());
        assert!(matches!(
            engine.start("gyro"),
            Err(PollError::UnknownChannel(_))
        ));
        assert!(matches!(
            engine.add_channel("als"),
            Err(PollError::DuplicateChannel(_))
        ));
    }

    #[test]
    fn unbalanced_stop_is_harmless() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = interval_engine(dir.path(), &Counters::default());
        engine.stop("als").expect("stop");
        assert_eq!(engine.ref_count("als"), Some(0));
    }

    #[test]
    fn open_failure_rolls_back_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);
        let doomed = dir.path().join("doomed");
        std::fs::write(&doomed, "1").expect("write");
        assert!(engine.add_source(&doomed, 1));
        std::fs::remove_file(&doomed).expect("remove");

        let err = engine.start("als").unwrap_err();
        assert!(matches!(err, PollError::Open { .. }));
        assert_eq!(engine.ref_count("als"), Some(0));
        assert!(!engine.is_running());
        assert_eq!(engine.open_count(), 0);
        assert!(!engine.standby_state().should_be_running);
    }

    #[test]
    fn start_without_sources_fails() {
        let engine = PollEngine::new("empty", PollMode::Interrupt, Recorder(Counters::default()));
        engine.add_channel("empty").expect("channel");
        assert!(matches!(engine.start("empty"), Err(PollError::NoSources(_))));
        assert_eq!(engine.ref_count("empty"), Some(0));
    }

    #[test]
    fn start_in_standby_defers_until_resume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);

        assert!(engine.standby());
        assert!(!engine.standby(), "standby is idempotent");
        engine.start("als").expect("start");
        assert!(!engine.is_running());
        assert_eq!(engine.open_count(), 0);
        assert!(engine.standby_state().should_be_running);

        assert!(engine.resume());
        assert!(!engine.resume(), "resume is idempotent");
        assert!(engine.is_running());
        assert_eq!(counters.engaged.load(Ordering::SeqCst), 1);

        engine.stop("als").expect("stop");
        assert!(!engine.is_running());
    }

    #[test]
    fn standby_releases_without_touching_refcount() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);

        engine.start("als").expect("start");
        assert!(engine.standby());
        assert!(!engine.is_running());
        assert_eq!(engine.ref_count("als"), Some(1));
        assert!(engine.status().channels.iter().all(|c| !c.running));

        engine.resume();
        assert!(engine.is_running());
        assert!(engine.status().channels.iter().all(|c| c.running));
        engine.stop("als").expect("stop");
    }

    #[test]
    fn stop_during_standby_clears_intent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);

        engine.start("als").expect("start");
        engine.standby();
        engine.stop("als").expect("stop");
        engine.resume();
        assert!(!engine.is_running());
        assert_eq!(counters.engaged.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn override_keeps_hardware_through_standby() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = interval_engine(dir.path(), &Counters::default());

        engine.set_standby_override(true);
        engine.start("als").expect("start");
        assert!(!engine.standby());
        assert!(engine.is_running());
        engine.stop("als").expect("stop");
    }

    #[test]
    fn override_while_in_standby_resumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = interval_engine(dir.path(), &Counters::default());

        engine.start("als").expect("start");
        engine.standby();
        engine.set_standby_override(true);
        assert!(engine.is_running());
        assert!(!engine.standby_state().in_standby);
        engine.stop("als").expect("stop");
    }

    #[test]
    fn clearing_override_honours_pending_standby() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = interval_engine(dir.path(), &Counters::default());

        engine.start("als").expect("start");
        engine.set_standby_override(true);
        assert!(!engine.standby());
        assert!(engine.is_running());
        assert!(engine.standby_state().standby_requested);

        engine.set_standby_override(false);
        assert!(!engine.is_running());
        assert!(engine.standby_state().in_standby);

        assert!(engine.resume());
        assert!(engine.is_running());
        assert!(!engine.standby_state().standby_requested);
        engine.stop("als").expect("stop");
    }

    #[test]
    fn resume_cancels_pending_standby() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = interval_engine(dir.path(), &Counters::default());

        engine.start("als").expect("start");
        engine.set_standby_override(true);
        engine.standby();
        assert!(!engine.resume());
        engine.set_standby_override(false);
        assert!(engine.is_running());
        assert!(!engine.standby_state().in_standby);
        engine.stop("als").expect("stop");
    }

    #[test]
    fn interval_only_in_interval_mode() {
        let engine = PollEngine::new("irq", PollMode::Interrupt, Recorder(Counters::default()));
        assert!(engine.interval().is_none());
        assert!(matches!(
            engine.set_interval(Duration::from_millis(10)),
            Err(PollError::NotIntervalMode(_))
        ));

        let dir = tempfile::tempdir().expect("tempdir");
        let engine = interval_engine(dir.path(), &Counters::default());
        engine.set_interval(Duration::from_millis(50)).expect("set");
        assert_eq!(engine.interval(), Some(Duration::from_millis(50)));
        assert_eq!(engine.status().interval_ms, Some(50));
    }

    #[test]
    fn power_control_follows_engagement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let power_path = dir.path().join("enable");
        std::fs::write(&power_path, "0").expect("write");
        let engine = interval_engine(dir.path(), &Counters::default())
            .with_power_control(PowerControl::new(&power_path));

        engine.start("als").expect("start");
        assert_eq!(std::fs::read_to_string(&power_path).expect("read"), "1");
        engine.stop("als").expect("stop");
        assert_eq!(std::fs::read_to_string(&power_path).expect("read"), "0");
    }

    #[test]
    fn interrupt_worker_dispatches_on_readiness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fifo = dir.path().join("event0");
        let c_path = std::ffi::CString::new(fifo.as_os_str().as_encoded_bytes()).expect("cstring");
        // SAFETY: c_path is a valid NUL-terminated path.
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let counters = Counters::default();
        let engine = PollEngine::new("accel", PollMode::Interrupt, Recorder(counters.clone()));
        engine.add_channel("accel").expect("channel");
        assert!(engine.add_source(&fifo, 0));
        engine.start("accel").expect("start");

        // The read end is open now, so a blocking writer open succeeds.
        let mut writer = std::fs::OpenOptions::new()
            .write(true)
            .open(&fifo)
            .expect("open writer");
        writer.write_all(b"abc").expect("write");

        assert!(wait_until(Duration::from_secs(5), || {
            lock(&counters.bytes).as_slice() == b"abc"
        }));

        engine.stop("accel").expect("stop");
        assert!(!engine.is_running());
        drop(writer);
    }

    #[test]
    fn dropping_engine_joins_worker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = Counters::default();
        let engine = interval_engine(dir.path(), &counters);
        engine.start("als").expect("start");
        drop(engine);
        let after_drop = counters.samples.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(counters.samples.load(Ordering::SeqCst), after_drop);
    }
}
