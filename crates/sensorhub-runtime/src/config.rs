//! Daemon configuration loaded from TOML.
//!
//! ```toml
//! socket_path = "/run/sensorhub/data.sock"
//!
//! [[channel]]
//! name = "light"
//! sample = "unsigned"
//! mode = "interval"
//! default_interval_ms = 200
//! paths = ["/sys/bus/iio/devices/iio:device0/in_illuminance_raw"]
//!
//! [[channel]]
//! name = "accel"
//! sample = "xyz"
//! [channel.input]
//! match_name = "accelerometer"
//! poll_rate_ms = 20
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use sensorhub_core::SampleKind;
use sensorhub_input::ScanConfig;
use sensorhub_input::event::{ABS_DISTANCE, ABS_MISC, ABS_X, ABS_Y, ABS_Z};
use serde::Deserialize;

use crate::cli;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    #[serde(default = "cli::default_data_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "cli::default_control_socket_path")]
    pub control_socket_path: PathBuf,
    /// Written to every data client before the handshake.
    #[serde(default = "default_preamble")]
    pub preamble: String,
    #[serde(default = "default_reclaim_timeout_ms")]
    pub reclaim_timeout_ms: u64,
    #[serde(default = "default_session_queue_depth")]
    pub session_queue_depth: usize,
    /// Sessions not bound on the data socket within this time are closed.
    #[serde(default = "default_bind_timeout_ms")]
    pub bind_timeout_ms: u64,
    #[serde(default, rename = "channel")]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeConfig {
    #[default]
    Interrupt,
    Interval,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    pub sample: SampleKind,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u32,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// sysfs attributes, one source each.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Input device discovery; mutually exclusive with `paths`.
    pub input: Option<InputConfig>,
    /// Written "1"/"0" when the hardware is engaged/released.
    pub power_control: Option<PathBuf>,
    #[serde(default)]
    pub standby_override: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub match_name: String,
    pub device_override: Option<PathBuf>,
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "default_device_prefix")]
    pub device_prefix: PathBuf,
    #[serde(default = "default_max_index")]
    pub max_index: u32,
    /// Hardware poll interval installed while the channel runs.
    pub poll_rate_ms: Option<u32>,
    #[serde(default = "default_required_axes")]
    pub required_axes: Vec<u16>,
    /// `EV_ABS` codes feeding the sample fields, in order. Defaults by kind.
    pub axes: Option<Vec<u16>>,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_preamble() -> String {
    "sensorhub\n".to_string()
}

fn default_reclaim_timeout_ms() -> u64 {
    2000
}

fn default_session_queue_depth() -> usize {
    64
}

fn default_bind_timeout_ms() -> u64 {
    10_000
}

fn default_interval_ms() -> u32 {
    200
}

fn default_buffer_capacity() -> usize {
    64
}

fn default_max_devices() -> usize {
    1
}

fn default_device_prefix() -> PathBuf {
    PathBuf::from("/dev/input/event")
}

fn default_max_index() -> u32 {
    32
}

fn default_required_axes() -> Vec<u16> {
    vec![ABS_X, ABS_Y]
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

impl HubConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn reclaim_timeout(&self) -> Duration {
        Duration::from_millis(self.reclaim_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("no channels configured");
        }
        if self.session_queue_depth == 0 {
            bail!("session_queue_depth must be positive");
        }
        let mut seen = HashSet::new();
        for ch in &self.channels {
            if ch.name.is_empty() {
                bail!("channel with empty name");
            }
            if !seen.insert(ch.name.as_str()) {
                bail!("duplicate channel {:?}", ch.name);
            }
            ch.validate()
                .with_context(|| format!("channel {:?}", ch.name))?;
        }
        Ok(())
    }
}

impl ChannelConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_capacity == 0 {
            bail!("buffer_capacity must be positive");
        }
        match (&self.input, self.paths.is_empty()) {
            (Some(_), false) => bail!("set either `paths` or `[channel.input]`, not both"),
            (None, true) => bail!("no sources: set `paths` or `[channel.input]`"),
            (Some(_), true) if self.mode == ModeConfig::Interval => {
                bail!("input channels are interrupt driven; remove `mode = \"interval\"`")
            }
            _ => {}
        }
        if self.mode == ModeConfig::Interval && self.default_interval_ms == 0 {
            bail!("default_interval_ms must be positive in interval mode");
        }
        Ok(())
    }
}

impl InputConfig {
    pub fn scan_config(&self) -> ScanConfig {
        let mut scan = ScanConfig::new(self.match_name.clone());
        scan.device_prefix = self.device_prefix.clone();
        scan.max_index = self.max_index;
        scan.required_axes = self.required_axes.clone();
        scan.max_devices = self.max_devices;
        scan.device_override = self.device_override.clone();
        scan
    }

    pub fn axes_for(&self, kind: SampleKind) -> Vec<u16> {
        if let Some(axes) = &self.axes {
            return axes.clone();
        }
        match kind {
            SampleKind::Xyz => vec![ABS_X, ABS_Y, ABS_Z],
            SampleKind::Proximity => vec![ABS_DISTANCE],
            SampleKind::Unsigned => vec![ABS_MISC],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
socket_path = "/tmp/hub/data.sock"
control_socket_path = "/tmp/hub/control.sock"

[[channel]]
name = "light"
sample = "unsigned"
mode = "interval"
default_interval_ms = 100
paths = ["/sys/light/raw"]
power_control = "/sys/light/enable"

[[channel]]
name = "accel"
sample = "xyz"
buffer_capacity = 128
[channel.input]
match_name = "accelerometer"
poll_rate_ms = 20
"#;

    #[test]
    fn parses_example_with_defaults() {
        let cfg = HubConfig::from_toml(EXAMPLE).expect("parse");
        assert_eq!(cfg.preamble, "sensorhub\n");
        assert_eq!(cfg.reclaim_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.session_queue_depth, 64);
        assert_eq!(cfg.bind_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.channels.len(), 2);

        let light = &cfg.channels[0];
        assert_eq!(light.sample, SampleKind::Unsigned);
        assert_eq!(light.mode, ModeConfig::Interval);
        assert_eq!(light.buffer_capacity, 64);
        assert!(!light.standby_override);

        let accel = &cfg.channels[1];
        assert_eq!(accel.mode, ModeConfig::Interrupt);
        let input = accel.input.as_ref().expect("input section");
        assert_eq!(input.max_devices, 1);
        assert_eq!(input.axes_for(SampleKind::Xyz), vec![ABS_X, ABS_Y, ABS_Z]);

        let scan = input.scan_config();
        assert_eq!(scan.match_name, "accelerometer");
        assert_eq!(scan.max_index, 32);
        assert_eq!(scan.device_prefix, PathBuf::from("/dev/input/event"));
    }

    #[test]
    fn rejects_duplicate_names() {
        let text = r#"
[[channel]]
name = "a"
sample = "unsigned"
paths = ["/x"]
[[channel]]
name = "a"
sample = "xyz"
paths = ["/y"]
"#;
        let err = HubConfig::from_toml(text).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_channel_without_sources() {
        let text = r#"
[[channel]]
name = "a"
sample = "unsigned"
"#;
        assert!(HubConfig::from_toml(text).is_err());
    }

    #[test]
    fn rejects_interval_input_channel() {
        let text = r#"
[[channel]]
name = "prox"
sample = "proximity"
mode = "interval"
[channel.input]
match_name = "proximity"
"#;
        assert!(HubConfig::from_toml(text).is_err());
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = r#"
[[channel]]
name = "a"
sample = "unsigned"
paths = ["/x"]
colour = "blue"
"#;
        assert!(HubConfig::from_toml(text).is_err());
    }

    #[test]
    fn rejects_empty_config() {
        assert!(HubConfig::from_toml("").is_err());
    }
}
