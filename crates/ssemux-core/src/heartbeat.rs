//! Heartbeat producer for idle stream sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::StreamSession;

/// Spawn a task that writes a heartbeat comment to `session` every
/// `interval`.
///
/// The task is just another producer: each heartbeat queues on the session
/// mutex behind earlier writers. It stops when `shutdown` is cancelled, when
/// the session is closed, or when the reader goes away.
pub fn spawn_heartbeat(
    session: Arc<StreamSession>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let closed = session.closed_token();
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if !session.keep_alive().await {
                        debug!(stream_id = %session.stream_id(), "Heartbeat stopping: session no longer writable");
                        return;
                    }
                }
                () = shutdown.cancelled() => {
                    info!(stream_id = %session.stream_id(), "Heartbeat task shutting down");
                    return;
                }
                () = closed.cancelled() => {
                    debug!(stream_id = %session.stream_id(), "Heartbeat stopping: session closed");
                    return;
                }
            }
        }
    })
}
