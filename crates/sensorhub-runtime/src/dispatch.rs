//! Dispatcher: moves samples from ring readers to session sockets.
//!
//! Reader wakers post session ids into a bounded channel. A wake-up that
//! finds the channel full is dropped, so a periodic sweep drains every
//! session as a backstop. The sweep also closes sessions that were opened
//! but never bound on the data socket.

use std::sync::Arc;
use std::time::Duration;

use sensorhub_core::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::context::HubContext;

pub const WAKE_QUEUE_DEPTH: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

pub async fn run_dispatcher(ctx: Arc<HubContext>, mut wake_rx: mpsc::Receiver<SessionId>) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            woke = wake_rx.recv() => match woke {
                Some(id) => {
                    let written = ctx.drain_session(id);
                    trace!(session = id, written, "drained");
                }
                None => break,
            },
            _ = sweep.tick() => {
                let written = ctx.drain_all();
                if written > 0 {
                    trace!(written, "sweep drained");
                }
                ctx.reap_unbound(ctx.bind_timeout());
            }
        }
    }
    debug!("dispatcher stopped");
}
