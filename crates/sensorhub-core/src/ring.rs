//! BroadcastBuffer: fixed-capacity ring of sample slots with one producer and
//! any number of independently paced readers.
//!
//! - The producer owns a [`RingWriter`]: it fills a staging slot obtained from
//!   [`RingWriter::next_slot`], publishes it with [`RingWriter::commit`] and
//!   then calls [`RingWriter::wake_up_readers`].
//! - Each reader owns a [`RingReader`] holding its own cursor. Joining starts
//!   the cursor at the current write position; dropping the reader unjoins it.
//! - A reader that falls more than `capacity` slots behind loses its oldest
//!   unread samples. The loss is reported through [`ReadOutcome::dropped`],
//!   never silently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Callback invoked on every wake-up; used to forward readiness into an
/// async dispatcher. Must not block.
pub type ReaderWaker = Arc<dyn Fn() + Send + Sync>;

// ─── Types ──────────────────────────────────────────────────────────

/// Result of draining a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Samples appended to the output.
    pub read: usize,
    /// Samples overwritten before this reader got to them.
    pub dropped: u64,
}

// ─── Internal ───────────────────────────────────────────────────────

struct Ring<T> {
    slots: Vec<T>,
    /// Total number of commits since creation; the write cursor is
    /// `written % capacity`.
    written: u64,
}

struct ReaderSignal {
    pending: Mutex<bool>,
    ready: Condvar,
    waker: Option<ReaderWaker>,
}

impl ReaderSignal {
    fn raise(&self) {
        *lock(&self.pending) = true;
        self.ready.notify_all();
        if let Some(waker) = &self.waker {
            waker();
        }
    }
}

#[derive(Default)]
struct ReaderTable {
    next_id: u64,
    entries: Vec<(u64, Arc<ReaderSignal>)>,
}

struct Shared<T> {
    capacity: usize,
    ring: Mutex<Ring<T>>,
    readers: Mutex<ReaderTable>,
    writer_taken: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── BroadcastBuffer ────────────────────────────────────────────────

/// Shared handle to a ring buffer. Cloning is cheap; all clones refer to the
/// same slots.
pub struct BroadcastBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Copy + Default + Send + 'static> BroadcastBuffer<T> {
    /// Create a buffer with room for `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                capacity,
                ring: Mutex::new(Ring {
                    slots: vec![T::default(); capacity],
                    written: 0,
                }),
                readers: Mutex::new(ReaderTable::default()),
                writer_taken: AtomicBool::new(false),
            }),
        }
    }

    /// Claim the single producer handle. Returns `None` while another writer
    /// is alive.
    pub fn take_writer(&self) -> Option<RingWriter<T>> {
        if self.shared.writer_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(RingWriter {
            shared: Arc::clone(&self.shared),
            staging: T::default(),
        })
    }

    /// Attach a reader whose cursor starts at the current write position.
    pub fn join(&self) -> RingReader<T> {
        self.join_inner(None)
    }

    /// Attach a reader that also invokes `waker` every time the producer
    /// wakes readers.
    pub fn join_with_waker(&self, waker: ReaderWaker) -> RingReader<T> {
        self.join_inner(Some(waker))
    }

    /// Detach a reader. Equivalent to dropping it.
    pub fn unjoin(&self, reader: RingReader<T>) {
        drop(reader);
    }

    fn join_inner(&self, waker: Option<ReaderWaker>) -> RingReader<T> {
        let signal = Arc::new(ReaderSignal {
            pending: Mutex::new(false),
            ready: Condvar::new(),
            waker,
        });

        // Register before sampling the cursor: a wake racing with the join
        // is then at worst spurious, never lost.
        let id = {
            let mut table = lock(&self.shared.readers);
            let id = table.next_id;
            table.next_id += 1;
            table.entries.push((id, Arc::clone(&signal)));
            id
        };
        let cursor = lock(&self.shared.ring).written;

        RingReader {
            shared: Arc::clone(&self.shared),
            id,
            cursor,
            signal,
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn reader_count(&self) -> usize {
        lock(&self.shared.readers).entries.len()
    }

    /// Total number of commits since the buffer was created.
    pub fn written(&self) -> u64 {
        lock(&self.shared.ring).written
    }
}

// ─── RingWriter ─────────────────────────────────────────────────────

/// The producer side. Exactly one exists per buffer at a time.
pub struct RingWriter<T> {
    shared: Arc<Shared<T>>,
    staging: T,
}

impl<T: Copy + Default> RingWriter<T> {
    /// Mutable handle to the slot that the next [`commit`](Self::commit)
    /// publishes. Reset to `T::default()` on every call.
    pub fn next_slot(&mut self) -> &mut T {
        self.staging = T::default();
        &mut self.staging
    }

    /// Publish the slot obtained from [`next_slot`](Self::next_slot) and
    /// advance the write cursor, wrapping at capacity.
    pub fn commit(&mut self) {
        let mut ring = lock(&self.shared.ring);
        let idx = (ring.written % self.shared.capacity as u64) as usize;
        ring.slots[idx] = self.staging;
        ring.written += 1;
    }

    /// Shorthand for `*next_slot() = sample; commit()`.
    pub fn write(&mut self, sample: T) {
        *self.next_slot() = sample;
        self.commit();
    }

    /// Notify every attached reader that new data exists. Call after
    /// [`commit`](Self::commit).
    pub fn wake_up_readers(&self) {
        let signals: Vec<Arc<ReaderSignal>> = lock(&self.shared.readers)
            .entries
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        // Wakers run outside the table lock so they may join/unjoin freely.
        for signal in signals {
            signal.raise();
        }
    }
}

impl<T> Drop for RingWriter<T> {
    fn drop(&mut self) {
        self.shared.writer_taken.store(false, Ordering::Release);
    }
}

// ─── RingReader ─────────────────────────────────────────────────────

/// One reader's independent cursor into a buffer.
pub struct RingReader<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    /// Sequence number of the next sample this reader will return.
    cursor: u64,
    signal: Arc<ReaderSignal>,
}

impl<T: Copy> RingReader<T> {
    /// Number of unread samples still held by the ring.
    pub fn available(&self) -> usize {
        let written = lock(&self.shared.ring).written;
        written
            .saturating_sub(self.cursor)
            .min(self.shared.capacity as u64) as usize
    }

    /// Append every unread sample to `out`, oldest first, and advance the
    /// cursor to the write position.
    pub fn read(&mut self, out: &mut Vec<T>) -> ReadOutcome {
        self.read_at_most(usize::MAX, out)
    }

    /// Like [`read`](Self::read) but stops after `max` samples.
    pub fn read_at_most(&mut self, max: usize, out: &mut Vec<T>) -> ReadOutcome {
        let ring = lock(&self.shared.ring);
        let capacity = self.shared.capacity as u64;

        let mut dropped = 0;
        let oldest_kept = ring.written.saturating_sub(capacity);
        if self.cursor < oldest_kept {
            dropped = oldest_kept - self.cursor;
            self.cursor = oldest_kept;
        }

        let pending = (ring.written - self.cursor).min(max as u64);
        out.reserve(pending as usize);
        for seq in self.cursor..self.cursor + pending {
            out.push(ring.slots[(seq % capacity) as usize]);
        }
        self.cursor += pending;
        if self.cursor == ring.written {
            // Caught up: a wake raised for what was just read is spent.
            *lock(&self.signal.pending) = false;
        }

        ReadOutcome {
            read: pending as usize,
            dropped,
        }
    }

    /// Block until the producer wakes readers or `timeout` elapses. Returns
    /// `true` if unread data is available.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        if self.available() > 0 {
            return true;
        }
        let pending = lock(&self.signal.pending);
        let (mut pending, _) = self
            .signal
            .ready
            .wait_timeout_while(pending, timeout, |p| !*p)
            .unwrap_or_else(PoisonError::into_inner);
        *pending = false;
        drop(pending);
        self.available() > 0
    }
}

impl<T> Drop for RingReader<T> {
    fn drop(&mut self) {
        lock(&self.shared.readers)
            .entries
            .retain(|(id, _)| *id != self.id);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
