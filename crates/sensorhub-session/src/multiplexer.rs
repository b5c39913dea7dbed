//! SessionMultiplexer: local data socket with per-session fan-out.
//!
//! Connection lifecycle:
//! 1. accept, write the preamble
//! 2. read a 4-byte little-endian session id; until then the connection is
//!    unbound and `write` reports [`WriteOutcome::Unbound`]
//! 3. bound: bytes passed to `write` are queued to the session's task
//! 4. the client disconnects ([`SessionEvent::Lost`]) or the owner calls
//!    [`SessionMultiplexer::remove_session`]
//!
//! Removal detaches the session at once. The connection task is then
//! reclaimed through a queue that waits for the task to finish, bounded by
//! `reclaim_timeout`, before it is aborted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use sensorhub_core::SessionId;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection;
use crate::error::SessionError;
use crate::pacing::SessionConfig;

// ─── Types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Written to every client right after accept.
    pub preamble: Bytes,
    /// Outbound messages buffered per session before `write` reports
    /// [`WriteOutcome::Backlogged`].
    pub queue_depth: usize,
    /// Upper bound on waiting for a removed session's task to finish.
    pub reclaim_timeout: Duration,
    /// Time a client has to send its session id.
    pub handshake_timeout: Duration,
    /// Permission bits applied to the socket file.
    pub socket_mode: u32,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            preamble: Bytes::from_static(b"sensorhub\n"),
            queue_depth: 64,
            reclaim_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            socket_mode: 0o660,
        }
    }
}

/// Notifications for the multiplexer's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The client completed the handshake.
    Bound(SessionId),
    /// The client went away on its own.
    Lost(SessionId),
}

/// Result of [`SessionMultiplexer::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Handed to the session's task.
    Queued,
    /// No bound session with that id: not yet handshaken, or already gone.
    Unbound,
    /// The session's queue is full; the bytes were dropped.
    Backlogged,
}

impl WriteOutcome {
    pub fn is_delivered(self) -> bool {
        self == Self::Queued
    }
}

pub(crate) enum Outbound {
    Data(Bytes),
    Configure(SessionConfig),
}

struct Bound {
    conn: u64,
    tx: mpsc::Sender<Outbound>,
}

// ─── Shared state ───────────────────────────────────────────────────

pub(crate) struct Inner {
    pub(crate) config: MultiplexerConfig,
    path: PathBuf,
    sessions: Mutex<HashMap<SessionId, Bound>>,
    /// Pacing per session id, kept across the handshake so a session can be
    /// configured before its client connects.
    configs: Mutex<HashMap<SessionId, SessionConfig>>,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    reclaim: mpsc::UnboundedSender<u64>,
    pending_reclaims: AtomicUsize,
    next_conn: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Register a handshaken connection. Returns the pacing to start with.
    pub(crate) fn bind(
        &self,
        id: SessionId,
        conn: u64,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<SessionConfig, SessionError> {
        {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(&id) {
                return Err(SessionError::DuplicateSession(id));
            }
            sessions.insert(id, Bound { conn, tx });
        }
        let config = lock(&self.configs).get(&id).copied().unwrap_or_default();
        self.emit(SessionEvent::Bound(id));
        Ok(config)
    }

    /// Drop `id` if it is still served by `conn`. Returns whether it was.
    pub(crate) fn detach(&self, id: SessionId, conn: u64) -> bool {
        let mut sessions = lock(&self.sessions);
        if sessions.get(&id).is_some_and(|b| b.conn == conn) {
            sessions.remove(&id);
            drop(sessions);
            lock(&self.configs).remove(&id);
            return true;
        }
        false
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // The owner may have stopped listening; events are advisory.
        let _ = self.events.send(event);
    }

    pub(crate) fn forget_task(&self, conn: u64) {
        lock(&self.tasks).remove(&conn);
    }
}

// ─── SessionMultiplexer ─────────────────────────────────────────────

#[derive(Clone)]
pub struct SessionMultiplexer {
    inner: Arc<Inner>,
}

impl SessionMultiplexer {
    /// Bind `path` and start accepting. A leftover socket file that nobody
    /// answers on is unlinked once and the bind retried once.
    pub async fn listen(
        path: impl AsRef<Path>,
        config: MultiplexerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let path = path.as_ref().to_path_buf();
        let listener = bind_listener(&path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(config.socket_mode))?;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (reclaim_tx, reclaim_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            path,
            sessions: Mutex::new(HashMap::new()),
            configs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            background: Mutex::new(Vec::new()),
            events: events_tx,
            reclaim: reclaim_tx,
            pending_reclaims: AtomicUsize::new(0),
            next_conn: AtomicU64::new(0),
        });

        let accept = tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        let reclaimer = tokio::spawn(reclaim_loop(Arc::clone(&inner), reclaim_rx));
        lock(&inner.background).extend([accept, reclaimer]);

        info!(path = %inner.path.display(), "data socket listening");
        Ok((Self { inner }, events_rx))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Queue `data` for session `id`. Never blocks and never fails: a missing
    /// session is an expected race and only logged at debug level.
    pub fn write(&self, id: SessionId, data: &[u8]) -> WriteOutcome {
        let sessions = lock(&self.inner.sessions);
        let Some(bound) = sessions.get(&id) else {
            debug!(session = id, "write to unbound session");
            return WriteOutcome::Unbound;
        };
        match bound.tx.try_send(Outbound::Data(Bytes::copy_from_slice(data))) {
            Ok(()) => WriteOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                debug!(session = id, "session queue full, dropping write");
                WriteOutcome::Backlogged
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = id, "session task gone");
                WriteOutcome::Unbound
            }
        }
    }

    /// Set the pacing for `id`, now or whenever it binds.
    pub fn configure(&self, id: SessionId, config: SessionConfig) {
        lock(&self.inner.configs).insert(id, config);
        let sessions = lock(&self.inner.sessions);
        if let Some(bound) = sessions.get(&id)
            && bound.tx.try_send(Outbound::Configure(config)).is_err()
        {
            warn!(session = id, "could not deliver session config");
        }
    }

    /// Detach `id` immediately and queue its connection for reclamation.
    /// Returns `false` if no such session was bound.
    pub fn remove_session(&self, id: SessionId) -> bool {
        lock(&self.inner.configs).remove(&id);
        let Some(bound) = lock(&self.inner.sessions).remove(&id) else {
            debug!(session = id, "remove of unknown session");
            return false;
        };
        // Dropping the sender tells the task to close.
        drop(bound.tx);

        self.inner.pending_reclaims.fetch_add(1, Ordering::AcqRel);
        if self.inner.reclaim.send(bound.conn).is_err() {
            self.inner.pending_reclaims.fetch_sub(1, Ordering::AcqRel);
        }
        info!(session = id, "session removed");
        true
    }

    pub fn is_bound(&self, id: SessionId) -> bool {
        lock(&self.inner.sessions).contains_key(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = lock(&self.inner.sessions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Removed sessions whose connection has not been reclaimed yet.
    pub fn pending_reclamations(&self) -> usize {
        self.inner.pending_reclaims.load(Ordering::Acquire)
    }

    /// Stop accepting, drop every session and unlink the socket file.
    pub fn shutdown(&self) {
        for handle in lock(&self.inner.background).drain(..) {
            handle.abort();
        }
        lock(&self.inner.sessions).clear();
        for (_, handle) in lock(&self.inner.tasks).drain() {
            handle.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.inner.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.inner.path.display(), error = %e, "failed to unlink data socket");
        }
        info!(path = %self.inner.path.display(), "data socket closed");
    }
}

// ─── Background tasks ───────────────────────────────────────────────

async fn bind_listener(path: &Path) -> Result<UnixListener, SessionError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(first) if path.exists() => {
            if UnixStream::connect(path).await.is_ok() {
                return Err(SessionError::AddressInUse(path.to_path_buf()));
            }
            debug!(path = %path.display(), error = %first, "bind failed, unlinking stale socket");
            std::fs::remove_file(path)?;
            info!(path = %path.display(), "removed stale socket");
            UnixListener::bind(path).map_err(|source| SessionError::Bind {
                path: path.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(SessionError::Bind {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let conn = inner.next_conn.fetch_add(1, Ordering::Relaxed);
                debug!(conn, "client connected");
                // Hold the table while spawning so the task cannot finish and
                // forget itself before it is recorded.
                let mut tasks = lock(&inner.tasks);
                let handle = tokio::spawn(connection::serve(Arc::clone(&inner), conn, stream));
                tasks.insert(conn, handle);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn reclaim_loop(inner: Arc<Inner>, mut queue: mpsc::UnboundedReceiver<u64>) {
    while let Some(conn) = queue.recv().await {
        let handle = lock(&inner.tasks).remove(&conn);
        if let Some(mut handle) = handle
            && tokio::time::timeout(inner.config.reclaim_timeout, &mut handle)
                .await
                .is_err()
        {
            warn!(conn, "connection task did not quiesce, aborting");
            handle.abort();
        }
        inner.pending_reclaims.fetch_sub(1, Ordering::AcqRel);
        debug!(conn, "connection reclaimed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const PREAMBLE: &[u8] = b"test-hub\n";
    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> MultiplexerConfig {
        MultiplexerConfig {
            preamble: Bytes::from_static(PREAMBLE),
            reclaim_timeout: Duration::from_millis(500),
            ..MultiplexerConfig::default()
        }
    }

    async fn start(
        dir: &tempfile::TempDir,
    ) -> (SessionMultiplexer, mpsc::UnboundedReceiver<SessionEvent>) {
        SessionMultiplexer::listen(dir.path().join("data.sock"), test_config())
            .await
            .expect("listen")
    }

    async fn connect(mux: &SessionMultiplexer, id: SessionId) -> UnixStream {
        let mut stream = UnixStream::connect(mux.path()).await.expect("connect");
        let mut preamble = vec![0u8; PREAMBLE.len()];
        timeout(WAIT, stream.read_exact(&mut preamble))
            .await
            .expect("preamble timeout")
            .expect("preamble");
        assert_eq!(preamble, PREAMBLE);
        stream.write_all(&id.to_le_bytes()).await.expect("send id");
        stream
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel open")
    }

    async fn expect_eof(stream: &mut UnixStream) {
        let mut buf = [0u8; 8];
        let n = timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("read timeout")
            .expect("read");
        assert_eq!(n, 0, "expected the server to close the connection");
    }

    #[tokio::test]
    async fn end_to_end_delivers_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, mut events) = start(&dir).await;

        let mut client = connect(&mux, 42).await;
        assert_eq!(next_event(&mut events).await, SessionEvent::Bound(42));

        assert_eq!(mux.write(42, &[0xA1; 16]), WriteOutcome::Queued);
        assert_eq!(mux.write(42, &[0xB2; 16]), WriteOutcome::Queued);

        let mut got = [0u8; 32];
        timeout(WAIT, client.read_exact(&mut got))
            .await
            .expect("read timeout")
            .expect("read");
        assert_eq!(&got[..16], &[0xA1; 16]);
        assert_eq!(&got[16..], &[0xB2; 16]);
        mux.shutdown();
    }

    #[tokio::test]
    async fn write_to_unbound_session_is_not_delivered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, _events) = start(&dir).await;
        let outcome = mux.write(99, &[1, 2, 3]);
        assert_eq!(outcome, WriteOutcome::Unbound);
        assert!(!outcome.is_delivered());
        mux.shutdown();
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, mut events) = start(&dir).await;

        let _first = connect(&mux, 7).await;
        assert_eq!(next_event(&mut events).await, SessionEvent::Bound(7));

        let mut second = connect(&mux, 7).await;
        expect_eof(&mut second).await;
        assert_eq!(mux.session_ids(), vec![7]);
        mux.shutdown();
    }

    #[tokio::test]
    async fn negative_session_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, _events) = start(&dir).await;

        let mut client = connect(&mux, -1).await;
        expect_eof(&mut client).await;
        assert!(mux.session_ids().is_empty());
        mux.shutdown();
    }

    #[tokio::test]
    async fn client_disconnect_emits_lost() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, mut events) = start(&dir).await;

        let client = connect(&mux, 3).await;
        assert_eq!(next_event(&mut events).await, SessionEvent::Bound(3));
        drop(client);

        assert_eq!(next_event(&mut events).await, SessionEvent::Lost(3));
        assert!(!mux.is_bound(3));
        assert_eq!(mux.write(3, &[0]), WriteOutcome::Unbound);
        mux.shutdown();
    }

    #[tokio::test]
    async fn removed_session_is_detached_then_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, mut events) = start(&dir).await;

        let mut client = connect(&mux, 5).await;
        assert_eq!(next_event(&mut events).await, SessionEvent::Bound(5));

        assert!(mux.remove_session(5));
        assert_eq!(mux.write(5, &[0]), WriteOutcome::Unbound);
        assert!(!mux.remove_session(5));
        expect_eof(&mut client).await;

        timeout(WAIT, async {
            while mux.pending_reclamations() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reclamation timeout");
        mux.shutdown();
    }

    #[tokio::test]
    async fn config_set_before_bind_applies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, mut events) = start(&dir).await;
        mux.configure(
            9,
            SessionConfig {
                batch_samples: 2,
                ..SessionConfig::default()
            },
        );

        let mut client = connect(&mux, 9).await;
        assert_eq!(next_event(&mut events).await, SessionEvent::Bound(9));

        assert!(mux.write(9, &[1; 4]).is_delivered());
        let mut got = [0u8; 8];
        assert!(
            timeout(Duration::from_millis(100), client.read_exact(&mut got))
                .await
                .is_err(),
            "a partial batch must not be flushed"
        );
        assert!(mux.write(9, &[2; 4]).is_delivered());
        timeout(WAIT, client.read_exact(&mut got))
            .await
            .expect("read timeout")
            .expect("read");
        assert_eq!(got, [1, 1, 1, 1, 2, 2, 2, 2]);
        mux.shutdown();
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data.sock");
        std::fs::write(&path, b"leftover").expect("stale file");

        let (mux, _events) = SessionMultiplexer::listen(&path, test_config())
            .await
            .expect("listen over stale file");
        let _client = connect(&mux, 1).await;
        mux.shutdown();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_listener_is_not_stolen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mux, _events) = start(&dir).await;

        let second = SessionMultiplexer::listen(mux.path(), test_config()).await;
        assert!(matches!(second, Err(SessionError::AddressInUse(_))));
        mux.shutdown();
    }
}
