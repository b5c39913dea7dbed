//! Per-session write pacing.
//!
//! A session can ask for a minimum spacing between socket writes and for
//! batching: samples accumulate until `batch_samples` are pending or the
//! oldest pending one has waited `batch_timeout`. The defaults write every
//! sample as soon as it arrives.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Minimum time between two socket writes. Zero disables spacing.
    pub min_interval: Duration,
    /// Flush once this many samples are pending. 0 and 1 both mean "each".
    pub batch_samples: usize,
    /// Flush a partial batch after its oldest sample waited this long.
    /// Zero means partial batches wait for `batch_samples`.
    pub batch_timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Pacer {
    config: SessionConfig,
    pending: BytesMut,
    count: usize,
    first_at: Option<Instant>,
    last_write: Option<Instant>,
}

impl Pacer {
    pub(crate) fn new(config: SessionConfig) -> Self {
        Self {
            config,
            pending: BytesMut::new(),
            count: 0,
            first_at: None,
            last_write: None,
        }
    }

    pub(crate) fn reconfigure(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub(crate) fn push(&mut self, data: &[u8], now: Instant) {
        if self.count == 0 {
            self.first_at = Some(now);
        }
        self.pending.extend_from_slice(data);
        self.count += 1;
    }

    /// When the pending bytes should be written. `None` when nothing is
    /// pending or a partial batch has no timeout.
    pub(crate) fn due(&self) -> Option<Instant> {
        let first_at = self.first_at?;
        let ready_at = if self.count >= self.config.batch_samples.max(1) {
            first_at
        } else if !self.config.batch_timeout.is_zero() {
            first_at + self.config.batch_timeout
        } else {
            return None;
        };
        let spaced_at = self
            .last_write
            .map_or(ready_at, |t| t + self.config.min_interval);
        Some(ready_at.max(spaced_at))
    }

    pub(crate) fn take_if_due(&mut self, now: Instant) -> Option<Bytes> {
        match self.due() {
            Some(at) if at <= now => {
                self.count = 0;
                self.first_at = None;
                self.last_write = Some(now);
                Some(self.pending.split().freeze())
            }
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_samples(&self) -> usize {
        self.count
    }
}
