//! Worker threads: the interrupt-driven `poll(2)` loop and the fixed-interval
//! loop. Exactly one runs per engaged engine.

use std::fs::File;
use std::io::{Seek, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::engine::{SampleProcessor, Shared};
use crate::error::PollError;

/// Readiness bits that mean "content changed". sysfs attribute notification
/// reports `POLLPRI | POLLERR`, character devices report `POLLIN`.
const READY_MASK: libc::c_short = libc::POLLIN | libc::POLLPRI | libc::POLLERR;
/// Bits after which a descriptor is dead until the next engage.
const DEAD_MASK: libc::c_short = libc::POLLHUP | libc::POLLNVAL;

enum Cancel {
    /// Write end of the cancellation pipe.
    Pipe(File),
    /// Dropping or sending on this sender ends the interval sleep.
    Interval(mpsc::Sender<()>),
}

/// Handle to a running worker thread.
pub(crate) struct Worker {
    name: String,
    cancel: Cancel,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn the interrupt-mode worker over every open source.
    pub(crate) fn spawn_interrupt<P: SampleProcessor>(
        name: &str,
        shared: Arc<Mutex<Shared<P>>>,
    ) -> Result<Self, PollError> {
        let fds: Vec<(usize, RawFd)> = {
            let guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
            guard
                .sources
                .iter()
                .enumerate()
                .filter_map(|(idx, s)| s.file().map(|f| (idx, f.as_raw_fd())))
                .collect()
        };

        let (read_end, write_end) = cancellation_pipe()?;
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("poll-{name}"))
            .spawn(move || run_interrupt(&thread_name, &shared, &fds, read_end))
            .map_err(PollError::Spawn)?;

        Ok(Self {
            name: name.to_string(),
            cancel: Cancel::Pipe(File::from(write_end)),
            handle,
        })
    }

    /// Spawn the interval-mode worker; `interval_ms` is re-read every tick.
    pub(crate) fn spawn_interval<P: SampleProcessor>(
        name: &str,
        shared: Arc<Mutex<Shared<P>>>,
        interval_ms: Arc<AtomicU64>,
    ) -> Result<Self, PollError> {
        let (tx, rx) = mpsc::channel();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("poll-{name}"))
            .spawn(move || run_interval(&thread_name, &shared, &interval_ms, &rx))
            .map_err(PollError::Spawn)?;

        Ok(Self {
            name: name.to_string(),
            cancel: Cancel::Interval(tx),
            handle,
        })
    }

    /// Signal cancellation and block until the thread has exited. Returns
    /// `false` if the worker could not be signalled and was detached; it may
    /// then still touch its descriptors.
    pub(crate) fn stop(self) -> bool {
        match self.cancel {
            Cancel::Pipe(mut pipe) => {
                if let Err(e) = pipe.write_all(&1u64.to_ne_bytes()) {
                    // The worker cannot be woken; joining would hang forever.
                    error!(engine = %self.name, error = %e, "failed to signal worker, detaching");
                    return false;
                }
            }
            Cancel::Interval(tx) => {
                // The worker may already be gone; the disconnect also cancels.
                let _ = tx.send(());
            }
        }
        if self.handle.join().is_err() {
            error!(engine = %self.name, "worker thread panicked");
        }
        debug!(engine = %self.name, "worker stopped");
        true
    }
}

fn cancellation_pipe() -> Result<(OwnedFd, OwnedFd), PollError> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    // SAFETY: `fds` is a valid two-element array for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(PollError::Pipe(std::io::Error::last_os_error()));
    }
    // SAFETY: pipe2 succeeded, both descriptors are open and owned by us.
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((read_end, write_end))
}

fn run_interrupt<P: SampleProcessor>(
    name: &str,
    shared: &Mutex<Shared<P>>,
    fds: &[(usize, RawFd)],
    cancel: OwnedFd,
) {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|(_, fd)| libc::pollfd {
            fd: *fd,
            events: libc::POLLIN | libc::POLLPRI,
            revents: 0,
        })
        .collect();
    pollfds.push(libc::pollfd {
        fd: cancel.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    });
    let cancel_slot = pollfds.len() - 1;

    debug!(engine = %name, sources = fds.len(), "interrupt worker started");

    loop {
        for p in &mut pollfds {
            p.revents = 0;
        }
        // SAFETY: `pollfds` is a live, correctly sized array of pollfd. The
        // descriptors stay open until the controller has joined this thread.
        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(engine = %name, error = %err, "poll failed, worker exiting");
            return;
        }

        if pollfds[cancel_slot].revents != 0 {
            break;
        }

        let mut ready = Vec::new();
        for (slot, (idx, _)) in fds.iter().enumerate() {
            let revents = pollfds[slot].revents;
            if revents & DEAD_MASK != 0 && revents & READY_MASK == 0 {
                warn!(engine = %name, source = idx, revents, "source hung up, ignoring until restart");
                // Negative descriptors are skipped by poll(2).
                pollfds[slot].fd = -1;
            } else if revents & READY_MASK != 0 {
                ready.push(*idx);
            }
        }
        dispatch(name, shared, ready.into_iter());
    }

    debug!(engine = %name, "interrupt worker cancelled");
}

fn run_interval<P: SampleProcessor>(
    name: &str,
    shared: &Mutex<Shared<P>>,
    interval_ms: &AtomicU64,
    cancel: &mpsc::Receiver<()>,
) {
    debug!(engine = %name, "interval worker started");
    loop {
        let count = shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sources
            .len();
        dispatch(name, shared, 0..count);

        let sleep = Duration::from_millis(interval_ms.load(Ordering::Relaxed).max(1));
        match cancel.recv_timeout(sleep) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(engine = %name, "interval worker cancelled");
}

/// Run the processor for every listed source index, rewinding each file to
/// offset 0 afterwards so the next tick reads the full content again.
fn dispatch<P: SampleProcessor>(
    name: &str,
    shared: &Mutex<Shared<P>>,
    indices: impl Iterator<Item = usize>,
) {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    let Shared { sources, processor } = &mut *guard;

    for idx in indices {
        let Some(source) = sources.get_mut(idx) else {
            continue;
        };
        let id = source.id();
        let Some(file) = source.file_mut() else {
            continue;
        };
        match processor.process_sample(id, file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!(engine = %name, source = id, "spurious wakeup");
            }
            Err(e) => {
                warn!(engine = %name, source = id, error = %e, "read failed, skipping tick");
            }
        }
        // Character devices do not seek; that is expected.
        if let Err(e) = file.rewind() {
            trace!(engine = %name, source = id, error = %e, "rewind unsupported");
        }
    }
}
