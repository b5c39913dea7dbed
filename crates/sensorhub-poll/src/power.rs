//! Write-only power control files (`"1"` to power up, `"0"` to power down).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PowerControl {
    path: PathBuf,
}

impl PowerControl {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set(&self, enabled: bool) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.write_all(if enabled { b"1" } else { b"0" })
    }
}
