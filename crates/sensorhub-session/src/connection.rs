//! One task per accepted connection: handshake, then pump queued bytes
//! through the session's pacer until the client leaves or the owner
//! detaches the session.

use std::sync::Arc;

use sensorhub_core::SessionId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use crate::error::SessionError;
use crate::multiplexer::{Inner, Outbound, SessionEvent};
use crate::pacing::Pacer;

pub(crate) async fn serve(inner: Arc<Inner>, conn: u64, mut stream: UnixStream) {
    let id = match handshake(&inner, &mut stream).await {
        Ok(id) => id,
        Err(e) => {
            warn!(conn, error = %e, "handshake rejected");
            inner.forget_task(conn);
            return;
        }
    };

    let (tx, rx) = mpsc::channel(inner.config.queue_depth.max(1));
    let config = match inner.bind(id, conn, tx) {
        Ok(config) => config,
        Err(e) => {
            warn!(conn, session = id, error = %e, "handshake rejected");
            inner.forget_task(conn);
            return;
        }
    };
    debug!(conn, session = id, "session bound");

    let lost = pump(id, &mut stream, rx, Pacer::new(config)).await;
    if lost && inner.detach(id, conn) {
        info!(session = id, "session lost");
        inner.emit(SessionEvent::Lost(id));
    }
    // The socket closes only after the owner has been told.
    drop(stream);
    inner.forget_task(conn);
}

async fn handshake(inner: &Inner, stream: &mut UnixStream) -> Result<SessionId, SessionError> {
    stream.write_all(&inner.config.preamble).await?;

    let mut raw = [0u8; 4];
    match timeout(inner.config.handshake_timeout, stream.read_exact(&mut raw)).await {
        Err(_) => return Err(SessionError::HandshakeTimeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(SessionError::MissingSessionId);
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(_)) => {}
    }

    let id = SessionId::from_le_bytes(raw);
    if id < 0 {
        return Err(SessionError::MalformedSessionId(id));
    }
    Ok(id)
}

/// Returns `true` if the client went away, `false` if the owner detached us.
async fn pump(
    id: SessionId,
    stream: &mut UnixStream,
    mut rx: mpsc::Receiver<Outbound>,
    mut pacer: Pacer,
) -> bool {
    let (mut reader, mut writer) = stream.split();
    let mut scratch = [0u8; 64];

    loop {
        let due = pacer.due();
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Outbound::Data(bytes)) => pacer.push(&bytes, Instant::now()),
                Some(Outbound::Configure(config)) => {
                    debug!(session = id, ?config, "session reconfigured");
                    pacer.reconfigure(config);
                }
                None => {
                    debug!(session = id, "session detached");
                    return false;
                }
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) => return true,
                Ok(n) => trace!(session = id, bytes = n, "ignoring client data"),
                Err(e) => {
                    debug!(session = id, error = %e, "read failed");
                    return true;
                }
            },
            () = sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => {}
        }

        if let Some(bytes) = pacer.take_if_due(Instant::now())
            && let Err(e) = writer.write_all(&bytes).await
        {
            debug!(session = id, error = %e, "write failed");
            return true;
        }
    }
}
