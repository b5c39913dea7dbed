//! Hardware poll-interval coupling.
//!
//! Some input drivers expose their polling period as a writable sysfs file
//! next to the device. While engaged we install our own value and put the
//! previous one back on release, so the shared hardware is left as found.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::InputError;

/// `<sysfs_root>/class/input/<eventN>/device/poll` for a `/dev/input/eventN`
/// node. `None` when the device path has no file name.
pub fn poll_rate_path(device: &Path, sysfs_root: &Path) -> Option<PathBuf> {
    let node = device.file_name()?;
    Some(
        sysfs_root
            .join("class/input")
            .join(node)
            .join("device/poll"),
    )
}

#[derive(Debug)]
pub struct PollRate {
    path: PathBuf,
    target_ms: u32,
    /// Value found at install time; `Some` while installed.
    saved: Option<String>,
}

impl PollRate {
    pub fn new(path: impl Into<PathBuf>, target_ms: u32) -> Self {
        Self {
            path: path.into(),
            target_ms,
            saved: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target_ms(&self) -> u32 {
        self.target_ms
    }

    pub fn is_installed(&self) -> bool {
        self.saved.is_some()
    }

    /// Remember the current value and write the target. A missing control
    /// file is not an error: the device simply has no adjustable rate.
    pub fn install(&mut self) -> Result<bool, InputError> {
        if self.saved.is_some() {
            return Ok(true);
        }
        let current = match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no poll rate control");
                return Ok(false);
            }
            Err(source) => {
                return Err(InputError::PollRate {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        self.write(self.target_ms)?;
        debug!(path = %self.path.display(), previous = %current, target_ms = self.target_ms, "poll rate installed");
        self.saved = Some(current);
        Ok(true)
    }

    /// Write back the value saved by [`install`](Self::install).
    pub fn restore(&mut self) -> Result<(), InputError> {
        let Some(previous) = self.saved.take() else {
            return Ok(());
        };
        fs::write(&self.path, &previous).map_err(|source| InputError::PollRate {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), restored = %previous, "poll rate restored");
        Ok(())
    }

    /// Change the target; applied immediately when installed.
    pub fn set_target(&mut self, target_ms: u32) -> Result<(), InputError> {
        self.target_ms = target_ms;
        if self.saved.is_some() {
            self.write(target_ms)?;
        }
        Ok(())
    }

    fn write(&self, ms: u32) -> Result<(), InputError> {
        fs::write(&self.path, ms.to_string()).map_err(|source| InputError::PollRate {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for PollRate {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "failed to restore poll rate on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_follows_sysfs_layout() {
        let path = poll_rate_path(Path::new("/dev/input/event3"), Path::new("/sys"));
        assert_eq!(path, Some(PathBuf::from("/sys/class/input/event3/device/poll")));
    }

    #[test]
    fn install_then_restore_leaves_file_as_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("poll");
        fs::write(&file, "100\n").expect("seed");

        let mut rate = PollRate::new(&file, 20);
        assert!(rate.install().expect("install"));
        assert_eq!(fs::read_to_string(&file).expect("read"), "20");

        rate.set_target(10).expect("retarget");
        assert_eq!(fs::read_to_string(&file).expect("read"), "10");

        rate.restore().expect("restore");
        assert!(!rate.is_installed());
        assert_eq!(fs::read_to_string(&file).expect("read"), "100");
    }

    #[test]
    fn missing_control_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rate = PollRate::new(dir.path().join("absent"), 20);
        assert!(!rate.install().expect("install"));
        rate.restore().expect("restore is a no-op");
        assert!(!dir.path().join("absent").exists());
    }

    #[test]
    fn set_target_while_released_only_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("poll");
        fs::write(&file, "100").expect("seed");

        let mut rate = PollRate::new(&file, 20);
        rate.set_target(5).expect("retarget");
        assert_eq!(fs::read_to_string(&file).expect("read"), "100");
        assert_eq!(rate.target_ms(), 5);
    }

    #[test]
    fn drop_restores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("poll");
        fs::write(&file, "250").expect("seed");
        {
            let mut rate = PollRate::new(&file, 20);
            rate.install().expect("install");
        }
        assert_eq!(fs::read_to_string(&file).expect("read"), "250");
    }
}
