//! Bounded discovery of input device nodes.
//!
//! A candidate qualifies when its name contains the configured substring and
//! its absolute-axis capability mask exposes every required axis.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use sensorhub_poll::{PollEngine, SampleProcessor};
use tracing::{debug, info, warn};

use crate::error::InputError;
use crate::event::{ABS_X, ABS_Y, EV_ABS};

/// What a probe learned about one device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    /// Bit `n` set when the device reports absolute axis code `n`.
    pub abs_axes: u64,
}

impl DeviceIdentity {
    pub fn has_axes(&self, axes: &[u16]) -> bool {
        axes.iter()
            .all(|axis| *axis < 64 && self.abs_axes & (1u64 << axis) != 0)
    }
}

/// Reads identity and capabilities from a device node.
pub trait DeviceProbe {
    fn probe(&self, path: &Path) -> std::io::Result<DeviceIdentity>;
}

impl<T: DeviceProbe + ?Sized> DeviceProbe for &T {
    fn probe(&self, path: &Path) -> std::io::Result<DeviceIdentity> {
        (**self).probe(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Candidates are `{device_prefix}{index}`.
    pub device_prefix: PathBuf,
    /// Exclusive upper bound on candidate indices.
    pub max_index: u32,
    pub match_name: String,
    pub required_axes: Vec<u16>,
    pub max_devices: usize,
    /// Used verbatim, without probing, when it exists.
    pub device_override: Option<PathBuf>,
}

impl ScanConfig {
    pub fn new(match_name: impl Into<String>) -> Self {
        Self {
            device_prefix: PathBuf::from("/dev/input/event"),
            max_index: 32,
            match_name: match_name.into(),
            required_axes: vec![ABS_X, ABS_Y],
            max_devices: 1,
            device_override: None,
        }
    }

    pub fn candidate(&self, index: u32) -> PathBuf {
        let mut raw = self.device_prefix.clone().into_os_string();
        raw.push(index.to_string());
        PathBuf::from(raw)
    }
}

/// Return the matching device paths in index order, at most `max_devices`.
pub fn scan(config: &ScanConfig, probe: impl DeviceProbe) -> Vec<PathBuf> {
    if let Some(path) = &config.device_override {
        if path.exists() {
            info!(path = %path.display(), "using configured input device");
            return vec![path.clone()];
        }
        warn!(path = %path.display(), "configured input device missing, scanning");
    }

    let mut found = Vec::new();
    for index in 0..config.max_index {
        if found.len() >= config.max_devices {
            break;
        }
        let path = config.candidate(index);
        if !path.exists() {
            continue;
        }
        match probe.probe(&path) {
            Ok(identity) => {
                let name_ok = identity.name.contains(&config.match_name);
                let axes_ok = identity.has_axes(&config.required_axes);
                debug!(path = %path.display(), name = %identity.name, name_ok, axes_ok, "probed");
                if name_ok && axes_ok {
                    found.push(path);
                }
            }
            Err(e) => debug!(path = %path.display(), error = %e, "probe failed"),
        }
    }
    found
}

/// Scan and register every match as a source of `engine`, numbered from 0.
/// Returns the number of sources registered, never zero.
pub fn scan_into<P: SampleProcessor>(
    engine: &PollEngine<P>,
    config: &ScanConfig,
    probe: impl DeviceProbe,
) -> Result<usize, InputError> {
    let registered = scan(config, probe)
        .iter()
        .enumerate()
        .filter(|(id, path)| engine.add_source(path, *id as u32))
        .count();
    if registered == 0 {
        return Err(InputError::DeviceNotFound(config.match_name.clone()));
    }
    Ok(registered)
}

// ─── Real evdev probe ───────────────────────────────────────────────

const NAME_LEN: usize = 256;
const IOC_READ: u32 = 2;

/// `_IOC(_IOC_READ, 'E', nr, size)`.
const fn evioc_read(nr: u32, size: usize) -> u32 {
    (IOC_READ << 30) | ((size as u32) << 16) | ((b'E' as u32) << 8) | nr
}

const fn eviocgname(len: usize) -> u32 {
    evioc_read(0x06, len)
}

const fn eviocgbit(ev: u16, len: usize) -> u32 {
    evioc_read(0x20 + ev as u32, len)
}

/// Probe using `EVIOCGNAME` and `EVIOCGBIT(EV_ABS)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvdevProbe;

impl DeviceProbe for EvdevProbe {
    fn probe(&self, path: &Path) -> std::io::Result<DeviceIdentity> {
        let file: File = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;
        let fd = file.as_raw_fd();

        let mut name = [0u8; NAME_LEN];
        // SAFETY: `name` is a writable buffer of exactly NAME_LEN bytes, the
        // size encoded in the request.
        let rc = unsafe { libc::ioctl(fd, eviocgname(NAME_LEN) as _, name.as_mut_ptr()) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let end = name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);

        let mut abs_axes = [0u8; 8];
        // SAFETY: `abs_axes` is a writable 8-byte buffer, the size encoded in
        // the request.
        let rc = unsafe { libc::ioctl(fd, eviocgbit(EV_ABS, abs_axes.len()) as _, abs_axes.as_mut_ptr()) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(DeviceIdentity {
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
            abs_axes: u64::from_le_bytes(abs_axes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;

    struct FakeProbe {
        devices: HashMap<PathBuf, DeviceIdentity>,
    }

    impl DeviceProbe for FakeProbe {
        fn probe(&self, path: &Path) -> std::io::Result<DeviceIdentity> {
            self.devices
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        }
    }

    struct Inert;

    impl SampleProcessor for Inert {
        fn process_sample(&mut self, _id: u32, _file: &mut File) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn identity(name: &str, axes: &[u16]) -> DeviceIdentity {
        DeviceIdentity {
            name: name.to_string(),
            abs_axes: axes.iter().fold(0, |acc, a| acc | (1u64 << a)),
        }
    }

    fn fixture(dir: &Path) -> (ScanConfig, FakeProbe) {
        let mut config = ScanConfig::new("accelerometer");
        config.device_prefix = dir.join("event");
        config.max_index = 8;

        let mut devices = HashMap::new();
        for idx in 0..3 {
            File::create(config.candidate(idx)).expect("create node");
        }
        // Name matches but lacks ABS_Y.
        devices.insert(config.candidate(0), identity("lis3 accelerometer", &[ABS_X]));
        devices.insert(
            config.candidate(1),
            identity("lis3 accelerometer", &[ABS_X, ABS_Y, 2]),
        );
        // Axes match but the name does not.
        devices.insert(config.candidate(2), identity("touchscreen", &[ABS_X, ABS_Y]));
        (config, FakeProbe { devices })
    }

    #[test]
    fn only_full_match_is_registered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config, probe) = fixture(dir.path());

        let engine = PollEngine::new("accel", sensorhub_poll::PollMode::Interrupt, Inert);
        assert_eq!(scan_into(&engine, &config, &probe).expect("one device"), 1);
        assert_eq!(engine.source_paths(), vec![config.candidate(1)]);
    }

    #[test]
    fn max_devices_bounds_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut config, mut probe) = fixture(dir.path());
        File::create(config.candidate(3)).expect("create node");
        probe.devices.insert(
            config.candidate(3),
            identity("bma accelerometer", &[ABS_X, ABS_Y]),
        );

        assert_eq!(scan(&config, &probe), vec![config.candidate(1)]);
        config.max_devices = 4;
        assert_eq!(
            scan(&config, &probe),
            vec![config.candidate(1), config.candidate(3)]
        );
    }

    #[test]
    fn override_skips_probing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut config, probe) = fixture(dir.path());
        config.device_override = Some(config.candidate(2));
        assert_eq!(scan(&config, &probe), vec![config.candidate(2)]);
    }

    #[test]
    fn missing_override_falls_back_to_scan() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut config, probe) = fixture(dir.path());
        config.device_override = Some(dir.path().join("gone"));
        assert_eq!(scan(&config, &probe), vec![config.candidate(1)]);
    }

    #[test]
    fn no_match_returns_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut config, probe) = fixture(dir.path());
        config.match_name = "gyroscope".to_string();
        assert!(scan(&config, &probe).is_empty());

        let engine = PollEngine::new("gyro", sensorhub_poll::PollMode::Interrupt, Inert);
        let err = scan_into(&engine, &config, &probe).expect_err("nothing matches");
        assert!(matches!(err, InputError::DeviceNotFound(ref name) if name == "gyroscope"));
        assert!(engine.source_paths().is_empty());
    }

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        // Values from <linux/input.h> on common architectures.
        assert_eq!(eviocgname(256), 0x8100_4506);
        assert_eq!(eviocgbit(EV_ABS, 8), 0x8008_4523);
    }
}
