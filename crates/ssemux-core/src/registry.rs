//! In-memory registry of stream sessions keyed by stream id.
//!
//! The registry owns the reader half of every session until a client
//! attaches, starts the heartbeat producer on attach, and evicts sessions
//! whose transport went away or that were never attached in time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::heartbeat::spawn_heartbeat;
use crate::session::{EventStream, SessionState, StreamSession};

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session not found: {stream_id}")]
    SessionNotFound { stream_id: String },

    #[error("Session already attached: {stream_id}")]
    AlreadyAttached { stream_id: String },
}

struct SessionEntry {
    session: Arc<StreamSession>,
    /// Reader half, parked here until the first attach.
    body: Option<EventStream>,
}

/// Thread-safe registry of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SessionConfig::default())
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create and register a new session.
    pub async fn create(&self) -> Arc<StreamSession> {
        let (session, body) = StreamSession::create(self.config.channel_capacity);
        let stream_id = session.stream_id().to_string();
        self.sessions.write().await.insert(
            stream_id.clone(),
            SessionEntry {
                session: Arc::clone(&session),
                body: Some(body),
            },
        );
        info!(stream_id = %stream_id, "Session registered");
        session
    }

    /// Get a session by stream id.
    pub async fn get(&self, stream_id: &str) -> Option<Arc<StreamSession>> {
        self.sessions
            .read()
            .await
            .get(stream_id)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Hand out the session's reader half. Only the first attach succeeds.
    ///
    /// Starts the heartbeat producer for the session when heartbeats are
    /// enabled.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn attach(&self, stream_id: &str) -> Result<EventStream, RegistryError> {
        let (session, body) = {
            let mut sessions = self.sessions.write().await;
            let entry =
                sessions
                    .get_mut(stream_id)
                    .ok_or_else(|| RegistryError::SessionNotFound {
                        stream_id: stream_id.to_string(),
                    })?;
            let body = entry
                .body
                .take()
                .ok_or_else(|| RegistryError::AlreadyAttached {
                    stream_id: stream_id.to_string(),
                })?;
            (Arc::clone(&entry.session), body)
        };

        if let Some(interval) = self.config.heartbeat_interval() {
            spawn_heartbeat(Arc::clone(&session), interval, self.shutdown.child_token());
        }
        info!(stream_id, "Session attached");
        Ok(body)
    }

    /// Whether the session's reader has been handed out.
    pub async fn is_attached(&self, stream_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(stream_id)
            .is_some_and(|entry| entry.body.is_none())
    }

    /// Close and remove a session.
    pub async fn remove(&self, stream_id: &str) -> bool {
        let entry = self.sessions.write().await.remove(stream_id);
        match entry {
            Some(entry) => {
                entry.session.close();
                info!(stream_id, "Session removed");
                true
            }
            None => {
                warn!(stream_id, "Tried to remove unknown session");
                false
            }
        }
    }

    /// Close and remove sessions whose reader is gone, plus sessions never
    /// attached and idle for longer than `max_idle`. Returns the evicted ids.
    pub async fn evict_idle(&self, max_idle: Option<Duration>) -> Vec<String> {
        let mut sessions = self.sessions.write().await;
        let mut evicted = Vec::new();

        sessions.retain(|stream_id, entry| {
            let closed = entry.session.state() == SessionState::Closed;
            let stale = entry.body.is_some()
                && max_idle.is_some_and(|max| entry.session.idle_for() > max);
            if closed || stale {
                entry.session.close();
                debug!(stream_id = %stream_id, closed, stale, "Evicting session");
                evicted.push(stream_id.clone());
                false
            } else {
                true
            }
        });
        drop(sessions);

        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted sessions");
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `sweep_interval` until
    /// `shutdown` is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let period = self.config.sweep_interval();
        let max_idle = self.config.idle_timeout();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.evict_idle(max_idle).await;
                    }
                    () = shutdown.cancelled() => {
                        debug!("Session sweeper shutting down");
                        return;
                    }
                }
            }
        })
    }

    /// Close every session and stop all heartbeat producers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut sessions = self.sessions.write().await;
        for entry in sessions.values() {
            entry.session.close();
        }
        let count = sessions.len();
        sessions.clear();
        drop(sessions);
        info!(count, "Closed all sessions");
    }

    /// Count of registered sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
