//! HubContext: everything the daemon shares between its tasks, built once in
//! `run_daemon` and passed around behind an `Arc`.
//!
//! Sessions are opened on the control socket, bound on the data socket and
//! each follows exactly one channel. The table here keeps the per-session
//! channel reference, interval vote and ring reader consistent with what the
//! multiplexer reports.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use sensorhub_core::{BufferRegistry, IntervalArbiter, ReaderWaker, SessionId};
use sensorhub_poll::EngineStatus;
use sensorhub_session::{SessionConfig, SessionMultiplexer, WriteOutcome};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelControl, EncodedReader};

// ─── Types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub sample: &'static str,
    pub wire_size: usize,
    pub sessions: usize,
    pub effective_interval_ms: u32,
    pub engine: EngineStatus,
}

/// Returned by `open_session`: what a client needs to attach to the data
/// socket.
#[derive(Debug, Clone, Serialize)]
pub struct SessionTicket {
    pub session: SessionId,
    pub channel: String,
    pub sample: &'static str,
    pub wire_size: usize,
    pub data_socket: String,
    pub preamble: String,
}

struct ClientSession {
    channel: String,
    started: bool,
    opened_at: Instant,
    /// Seen bound on the data socket at least once.
    bound: bool,
    reader: Box<dyn EncodedReader>,
}

#[derive(Default)]
struct SessionTable {
    next_id: SessionId,
    sessions: HashMap<SessionId, ClientSession>,
    arbiters: HashMap<String, IntervalArbiter>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── HubContext ─────────────────────────────────────────────────────

pub struct HubContext {
    registry: Arc<BufferRegistry>,
    channels: BTreeMap<String, Arc<dyn ChannelControl>>,
    multiplexer: SessionMultiplexer,
    /// Reader wakers post the session id here for the dispatcher.
    wake_tx: mpsc::Sender<SessionId>,
    preamble: String,
    bind_timeout: Duration,
    table: Mutex<SessionTable>,
}

impl HubContext {
    pub fn new(
        registry: Arc<BufferRegistry>,
        channels: Vec<Arc<dyn ChannelControl>>,
        multiplexer: SessionMultiplexer,
        wake_tx: mpsc::Sender<SessionId>,
        preamble: String,
        bind_timeout: Duration,
    ) -> Self {
        let mut table = SessionTable {
            next_id: 1,
            ..SessionTable::default()
        };
        let channels: BTreeMap<_, _> = channels
            .into_iter()
            .map(|ch| (ch.name().to_string(), ch))
            .collect();
        for (name, ch) in &channels {
            let default_ms = ch
                .status()
                .interval_ms
                .map_or(0, |ms| u32::try_from(ms).unwrap_or(u32::MAX));
            table
                .arbiters
                .insert(name.clone(), IntervalArbiter::new(default_ms));
        }
        Self {
            registry,
            channels,
            multiplexer,
            wake_tx,
            preamble,
            bind_timeout,
            table: Mutex::new(table),
        }
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn multiplexer(&self) -> &SessionMultiplexer {
        &self.multiplexer
    }

    /// How long an opened session may stay unbound on the data socket.
    pub fn bind_timeout(&self) -> Duration {
        self.bind_timeout
    }

    fn channel(&self, name: &str) -> anyhow::Result<&Arc<dyn ChannelControl>> {
        self.channels
            .get(name)
            .ok_or_else(|| anyhow!("unknown channel {name:?}"))
    }

    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let table = lock(&self.table);
        self.channels
            .values()
            .map(|ch| ChannelInfo {
                name: ch.name().to_string(),
                sample: ch.kind().as_str(),
                wire_size: ch.kind().wire_size(),
                sessions: table
                    .sessions
                    .values()
                    .filter(|s| s.channel == ch.name())
                    .count(),
                effective_interval_ms: table
                    .arbiters
                    .get(ch.name())
                    .map_or(0, IntervalArbiter::effective_ms),
                engine: ch.status(),
            })
            .collect()
    }

    // ── Session lifecycle ───────────────────────────────────────────

    /// Create a session following `channel`. `requested` picks the id,
    /// otherwise the next free one is allocated.
    pub fn open_session(
        &self,
        channel: &str,
        requested: Option<SessionId>,
    ) -> anyhow::Result<SessionTicket> {
        let ch = self.channel(channel)?;
        let mut table = lock(&self.table);

        let id = match requested {
            Some(id) if id < 0 => bail!("session id must not be negative"),
            Some(id) if table.sessions.contains_key(&id) => bail!("session {id} already exists"),
            Some(id) => id,
            None => {
                while table.sessions.contains_key(&table.next_id) {
                    table.next_id = table.next_id.checked_add(1).unwrap_or(1);
                }
                table.next_id
            }
        };
        if requested.is_none() {
            table.next_id = id.checked_add(1).unwrap_or(1);
        }

        let wake_tx = self.wake_tx.clone();
        // A full queue already holds a wake-up; the dispatcher drains everything.
        let waker: ReaderWaker = Arc::new(move || {
            let _ = wake_tx.try_send(id);
        });
        let reader = ch
            .join(waker)
            .with_context(|| format!("cannot join buffer of {channel:?}"))?;

        table.sessions.insert(
            id,
            ClientSession {
                channel: channel.to_string(),
                started: false,
                opened_at: Instant::now(),
                bound: false,
                reader,
            },
        );
        info!(session = id, channel, "session opened");

        Ok(SessionTicket {
            session: id,
            channel: channel.to_string(),
            sample: ch.kind().as_str(),
            wire_size: ch.kind().wire_size(),
            data_socket: self.multiplexer.path().display().to_string(),
            preamble: self.preamble.clone(),
        })
    }

    /// Take the session's reference on its channel. Idempotent.
    pub fn start_session(&self, id: SessionId) -> anyhow::Result<()> {
        let mut table = lock(&self.table);
        let session = table
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        if session.started {
            return Ok(());
        }
        self.channel(&session.channel)?.start()?;
        session.started = true;
        Ok(())
    }

    /// Release the session's reference on its channel. Idempotent.
    pub fn stop_session(&self, id: SessionId) -> anyhow::Result<()> {
        let mut table = lock(&self.table);
        let session = table
            .sessions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        if !session.started {
            return Ok(());
        }
        session.started = false;
        self.channel(&session.channel)?.stop()?;
        Ok(())
    }

    /// Record the session's interval vote and apply the arbitrated result.
    /// Returns the effective interval.
    pub fn set_interval(&self, id: SessionId, interval_ms: u32) -> anyhow::Result<u32> {
        let mut table = lock(&self.table);
        let channel = table
            .sessions
            .get(&id)
            .map(|s| s.channel.clone())
            .ok_or_else(|| anyhow!("unknown session {id}"))?;
        let arbiter = table
            .arbiters
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("no arbiter for {channel:?}"))?;
        arbiter.vote(id, interval_ms);
        let effective = arbiter.effective_ms();
        self.channel(&channel)?.set_interval_ms(effective)?;
        debug!(session = id, channel = %channel, vote = interval_ms, effective, "interval arbitrated");
        Ok(effective)
    }

    pub fn configure_session(&self, id: SessionId, config: SessionConfig) -> anyhow::Result<()> {
        if !lock(&self.table).sessions.contains_key(&id) {
            bail!("unknown session {id}");
        }
        self.multiplexer.configure(id, config);
        Ok(())
    }

    /// Tear a session down: drop its reference and vote, detach its reader
    /// and its socket. Returns `false` for an unknown id.
    pub fn close_session(&self, id: SessionId) -> bool {
        let mut table = lock(&self.table);
        let Some(session) = table.sessions.remove(&id) else {
            return false;
        };

        if let Some(arbiter) = table.arbiters.get_mut(&session.channel)
            && arbiter.withdraw(id)
        {
            let effective = arbiter.effective_ms();
            if let Ok(ch) = self.channel(&session.channel)
                && let Err(e) = ch.set_interval_ms(effective)
            {
                warn!(session = id, channel = %session.channel, error = %e, "failed to re-apply interval");
            }
        }
        if session.started
            && let Ok(ch) = self.channel(&session.channel)
            && let Err(e) = ch.stop()
        {
            warn!(session = id, channel = %session.channel, error = %e, "failed to stop channel");
        }
        drop(table);

        self.multiplexer.remove_session(id);
        info!(session = id, channel = %session.channel, "session closed");
        true
    }

    /// The client behind `id` disconnected from the data socket.
    pub fn on_session_lost(&self, id: SessionId) {
        if self.close_session(id) {
            info!(session = id, "lost session cleaned up");
        } else {
            debug!(session = id, "lost session was not open");
        }
    }

    /// The client behind `id` completed the data socket handshake.
    pub fn on_session_bound(&self, id: SessionId) {
        if let Some(session) = lock(&self.table).sessions.get_mut(&id) {
            session.bound = true;
        }
    }

    /// Close every session that has never bound on the data socket and was
    /// opened more than `max_age` ago. Returns the closed ids.
    pub fn reap_unbound(&self, max_age: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = {
            let mut table = lock(&self.table);
            table
                .sessions
                .iter_mut()
                .filter_map(|(id, session)| {
                    if !session.bound && self.multiplexer.is_bound(*id) {
                        session.bound = true;
                    }
                    (!session.bound && session.opened_at.elapsed() >= max_age).then_some(*id)
                })
                .collect()
        };
        for id in &expired {
            if self.close_session(*id) {
                warn!(session = *id, "session never bound on the data socket, closed");
            }
        }
        expired
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = lock(&self.table).sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ── Standby ─────────────────────────────────────────────────────

    /// Put every channel into standby. Returns the channels that entered it.
    pub fn standby_all(&self) -> Vec<String> {
        self.channels
            .values()
            .filter(|ch| ch.standby())
            .map(|ch| ch.name().to_string())
            .collect()
    }

    /// Resume every channel. Returns the channels that were in standby.
    pub fn resume_all(&self) -> Vec<String> {
        self.channels
            .values()
            .filter(|ch| ch.resume())
            .map(|ch| ch.name().to_string())
            .collect()
    }

    pub fn set_standby_override(&self, channel: &str, enabled: bool) -> anyhow::Result<()> {
        self.channel(channel)?.set_standby_override(enabled);
        Ok(())
    }

    // ── Data path ───────────────────────────────────────────────────

    /// Move everything unread for `id` onto its socket, one write per sample.
    /// Returns the number of samples written.
    pub fn drain_session(&self, id: SessionId) -> usize {
        let mut bytes = Vec::new();
        let wire_size = {
            let mut table = lock(&self.table);
            let Some(session) = table.sessions.get_mut(&id) else {
                return 0;
            };
            let outcome = session.reader.drain(&mut bytes);
            if outcome.dropped > 0 {
                warn!(session = id, channel = %session.channel, dropped = outcome.dropped, "reader fell behind, samples lost");
            }
            match self.channels.get(&session.channel) {
                Some(ch) => ch.kind().wire_size(),
                None => return 0,
            }
        };

        let mut written = 0;
        for record in bytes.chunks(wire_size) {
            match self.multiplexer.write(id, record) {
                WriteOutcome::Queued => written += 1,
                WriteOutcome::Unbound | WriteOutcome::Backlogged => {}
            }
        }
        written
    }

    pub fn drain_all(&self) -> usize {
        self.session_ids()
            .into_iter()
            .map(|id| self.drain_session(id))
            .sum()
    }

    /// Close every session, releasing all channel references.
    pub fn shutdown(&self) {
        for id in self.session_ids() {
            self.close_session(id);
        }
        self.multiplexer.shutdown();
    }
}
