//! Watched sources: the files an engine monitors.

use std::fs::{File, OpenOptions};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::PollError;

/// One monitored file. The handle is present only while the engine is
/// engaged.
#[derive(Debug)]
pub struct WatchedSource {
    path: PathBuf,
    id: u32,
    file: Option<File>,
}

impl WatchedSource {
    pub fn new(path: impl Into<PathBuf>, id: u32) -> Self {
        Self {
            path: path.into(),
            id,
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub(crate) fn file_mut(&mut self) -> Option<&mut File> {
        self.file.as_mut()
    }

    pub(crate) fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }
}

/// Open a source read-only and non-blocking, so a spurious wakeup can never
/// park the worker inside `read` while it holds the engine lock.
fn open_source(path: &Path) -> Result<File, PollError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
        .map_err(|source| PollError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Open every source or none: on the first failure the handles opened so far
/// in this attempt are closed and the error is returned.
pub(crate) fn open_all(sources: &mut [WatchedSource]) -> Result<(), PollError> {
    let mut opened = Vec::with_capacity(sources.len());
    for source in sources.iter() {
        // `opened` is dropped on early return, closing the partial set.
        opened.push(open_source(&source.path)?);
    }
    for (source, file) in sources.iter_mut().zip(opened) {
        source.file = Some(file);
    }
    Ok(())
}

pub(crate) fn close_all(sources: &mut [WatchedSource]) {
    for source in sources {
        source.file = None;
    }
}

/// Forget every handle without closing it, so the descriptor numbers stay
/// valid for whoever still polls them.
pub(crate) fn leak_all(sources: &mut [WatchedSource]) -> Vec<RawFd> {
    sources
        .iter_mut()
        .filter_map(|s| s.file.take())
        .map(IntoRawFd::into_raw_fd)
        .collect()
}
