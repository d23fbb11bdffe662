//! Stream session: the sole writer of one SSE output channel.
//!
//! Every write goes through the session's [`FifoMutex`], so frames from
//! concurrent producers land on the wire whole and in acquire order. The
//! event-id counter is only advanced while the mutex is held and only after
//! the frame was accepted by the channel.

use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{self, Chunk, Frame, Source};
use crate::error::{Error, Result};
use crate::mutex::FifoMutex;
use crate::source::ResponseSource;

/// Observable lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Output channel opened, sink not attached yet. Transient: `create`
    /// attaches the reader before returning, so callers only see this state
    /// during construction.
    Created,
    /// Readiness gate fulfilled, nothing sent yet.
    Ready,
    /// At least one frame committed.
    Active,
    /// Reader dropped or session closed.
    Closed,
}

/// One logical SSE channel shared by many producers.
pub struct StreamSession {
    stream_id: String,
    mutex: FifoMutex,
    tx: mpsc::Sender<Bytes>,
    /// Readiness gate, fulfilled once the reader half is attached.
    ready: watch::Sender<bool>,
    last_event_id: AtomicU64,
    closed: CancellationToken,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last committed frame or relay.
    last_write_ms: AtomicU64,
}

impl StreamSession {
    /// Open a session with a fresh stream id and an output channel holding up
    /// to `capacity` unread writes.
    ///
    /// Returns the session and the reader half to hand to the transport.
    pub fn create(capacity: usize) -> (Arc<Self>, EventStream) {
        Self::with_id(uuid::Uuid::new_v4().to_string(), capacity)
    }

    pub fn with_id(stream_id: String, capacity: usize) -> (Arc<Self>, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            stream_id,
            mutex: FifoMutex::new(),
            tx,
            ready: watch::Sender::new(false),
            last_event_id: AtomicU64::new(0),
            closed: CancellationToken::new(),
            created_at: Instant::now(),
            last_write_ms: AtomicU64::new(0),
        });
        let stream = EventStream::attach(rx, &session.ready);
        debug!(stream_id = %session.stream_id, capacity, "Session created");
        (session, stream)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Id of the last committed frame, 0 before the first.
    pub fn last_event_id(&self) -> u64 {
        self.last_event_id.load(Ordering::Acquire)
    }

    /// Advisory: true once more than one frame id has been assigned.
    pub fn has_active_consumer(&self) -> bool {
        self.last_event_id() > 1
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if !*self.ready.borrow() {
            SessionState::Created
        } else if self.last_event_id() == 0 {
            SessionState::Ready
        } else {
            SessionState::Active
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Tear the session down. Pending and future writes are abandoned.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            info!(stream_id = %self.stream_id, "Session closed");
        }
    }

    /// Token cancelled when the session is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Time since the last committed frame or relayed chunk.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_write_ms.load(Ordering::Acquire));
        self.created_at.elapsed().saturating_sub(last)
    }

    /// Classify `value`, then write it as the next frame.
    ///
    /// Returns the committed event id, or `None` if the write was abandoned
    /// because the channel rejected it (logged). Classification errors are
    /// returned before any lock is taken.
    pub async fn send(&self, value: impl Into<Source>) -> Result<Option<u64>> {
        let chunk = codec::classify(value.into())?;
        Ok(self.write_frame(None, &chunk).await)
    }

    /// Like [`send`](Self::send) with an `event:` line naming the frame.
    pub async fn send_event(&self, event: &str, value: impl Into<Source>) -> Result<Option<u64>> {
        let chunk = codec::classify(value.into())?;
        Ok(self.write_frame(Some(event), &chunk).await)
    }

    /// Write a heartbeat comment. Does not consume an event id.
    ///
    /// Returns `false` when the session can no longer accept writes.
    pub async fn keep_alive(&self) -> bool {
        if !self.wait_ready().await {
            return false;
        }
        let _lock = self.mutex.acquire().await;
        match self.write(codec::heartbeat()).await {
            Ok(()) => {
                debug!(stream_id = %self.stream_id, "Heartbeat sent");
                true
            }
            Err(e) => {
                debug!(stream_id = %self.stream_id, error = %e, "Heartbeat abandoned");
                false
            }
        }
    }

    /// Relay an already framed byte source straight into the channel.
    ///
    /// The mutex is held for the whole drain, so no other producer's frame can
    /// land in the middle of the relayed bytes. A long relay delays every other
    /// producer of this session until it finishes.
    ///
    /// If the source fails partway through a frame, the open frame is
    /// terminated before the mutex is released.
    ///
    /// Returns the number of bytes relayed.
    pub async fn sink_raw<S, T, E>(&self, source: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<T, E>>,
        T: Into<Bytes>,
        E: Display,
    {
        if !self.wait_ready().await {
            return Err(Error::WriteFailure("session closed".into()));
        }
        let mut source = std::pin::pin!(source);
        let _lock = self.mutex.acquire().await;

        let mut relayed = 0u64;
        // Trailing `\n` count of the relayed bytes, capped at 2.
        let mut trailing = 2;
        while let Some(item) = source.next().await {
            let chunk: Bytes = match item {
                Ok(chunk) => chunk.into(),
                Err(e) => {
                    let reason = e.to_string();
                    warn!(stream_id = %self.stream_id, relayed, error = %reason, "Relay source failed");
                    self.terminate_partial(trailing).await;
                    return Err(Error::DrainFailure(reason));
                }
            };
            if chunk.is_empty() {
                continue;
            }
            let len = chunk.len() as u64;
            let next_trailing = trailing_newlines(trailing, &chunk);
            if let Err(e) = self.write(chunk).await {
                warn!(stream_id = %self.stream_id, relayed, error = %e, "Relay write failed");
                return Err(e);
            }
            relayed += len;
            trailing = next_trailing;
            self.touch();
        }

        debug!(stream_id = %self.stream_id, relayed, "Relay drained");
        Ok(relayed)
    }

    /// Drain each source in order, each under its own lock acquisition.
    ///
    /// Sources without a body, or whose body is already being read, are
    /// skipped. The first failure is logged and ends the call; it is never
    /// returned. Returns the total number of bytes relayed.
    pub async fn pipe<I>(&self, sources: I) -> u64
    where
        I: IntoIterator<Item = ResponseSource>,
    {
        let mut total = 0;
        for (index, source) in sources.into_iter().enumerate() {
            let Some(body) = source.body else {
                debug!(stream_id = %self.stream_id, index, "Skipping source without body");
                continue;
            };
            let Some(mut reader) = body.reader() else {
                debug!(stream_id = %self.stream_id, index, "Skipping source locked by another reader");
                continue;
            };
            match self.sink_raw(&mut reader).await {
                Ok(n) => total += n,
                Err(e) => {
                    warn!(stream_id = %self.stream_id, index, error = %e, "Pipe stopped");
                    break;
                }
            }
        }
        total
    }

    async fn write_frame(&self, event: Option<&str>, chunk: &Chunk) -> Option<u64> {
        if !self.wait_ready().await {
            warn!(stream_id = %self.stream_id, "Write abandoned: session closed");
            return None;
        }
        let _lock = self.mutex.acquire().await;

        let id = self.last_event_id.load(Ordering::Acquire) + 1;
        let frame = Frame {
            id,
            event,
            chunk,
        }
        .encode();
        match self.write(frame).await {
            Ok(()) => {
                self.last_event_id.store(id, Ordering::Release);
                self.touch();
                debug!(stream_id = %self.stream_id, event_id = id, variant = %chunk.variant, "Frame sent");
                Some(id)
            }
            Err(e) => {
                warn!(stream_id = %self.stream_id, event_id = id, error = %e, "Write abandoned");
                None
            }
        }
    }

    /// Push one buffer into the channel. Caller must hold the mutex.
    async fn write(&self, bytes: Bytes) -> Result<()> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(Error::WriteFailure("session closed".into())),
            sent = self.tx.send(bytes) => {
                sent.map_err(|_| Error::WriteFailure("reader dropped".into()))
            }
        }
    }

    /// Close a frame left open by a failed relay so the next producer's frame
    /// starts on its own line. Caller must hold the mutex.
    async fn terminate_partial(&self, trailing: usize) {
        let terminator: &'static [u8] = match trailing {
            0 => b"\n\n",
            1 => b"\n",
            _ => return,
        };
        if let Err(e) = self.write(Bytes::from_static(terminator)).await {
            debug!(stream_id = %self.stream_id, error = %e, "Could not terminate partial frame");
        }
    }

    /// Wait for the readiness gate. `false` if the session closed first.
    async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            biased;
            () = self.closed.cancelled() => false,
            result = ready.wait_for(|ready| *ready) => result.is_ok(),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_write_ms.store(elapsed, Ordering::Release);
    }
}

/// Trailing `\n` count after appending `chunk` to bytes that ended in
/// `prev` newlines. Saturates at 2, a complete frame boundary.
fn trailing_newlines(prev: usize, chunk: &[u8]) -> usize {
    let run = chunk.iter().rev().take_while(|&&b| b == b'\n').count();
    let total = if run == chunk.len() { prev + run } else { run };
    total.min(2)
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("stream_id", &self.stream_id)
            .field("last_event_id", &self.last_event_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Reader half of a session: the byte stream served as the response body.
pub struct EventStream {
    inner: ReceiverStream<Bytes>,
}

impl EventStream {
    /// Attach the sink to the channel and fulfil the readiness gate.
    fn attach(rx: mpsc::Receiver<Bytes>, gate: &watch::Sender<bool>) -> Self {
        let stream = Self {
            inner: ReceiverStream::new(rx),
        };
        gate.send_replace(true);
        stream
    }
}

impl Stream for EventStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::source::{BodyHandle, BoxError};

    /// Collect everything currently buffered in `stream` as text.
    async fn drain(stream: &mut EventStream) -> String {
        let mut out = Vec::new();
        while let Ok(Some(bytes)) =
            tokio::time::timeout(Duration::from_millis(20), stream.next()).await
        {
            out.extend_from_slice(&bytes);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn send_assigns_sequential_ids_and_tracks_consumer() {
        let (session, mut stream) = StreamSession::create(16);
        assert_eq!(session.state(), SessionState::Ready);

        let id = session.send(json!({"status": "init"})).await.unwrap();
        assert_eq!(id, Some(1));
        assert!(!session.has_active_consumer());
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(drain(&mut stream).await, "id: 1\ndata: {\"status\":\"init\"}\n\n");

        let id = session.send(json!({"status": "connected"})).await.unwrap();
        assert_eq!(id, Some(2));
        assert!(session.has_active_consumer());
        assert_eq!(
            drain(&mut stream).await,
            "id: 2\ndata: {\"status\":\"connected\"}\n\n"
        );
    }

    #[tokio::test]
    async fn keep_alive_does_not_consume_ids() {
        let (session, mut stream) = StreamSession::create(16);
        assert!(session.keep_alive().await);
        assert_eq!(session.last_event_id(), 0);

        session.send("hello").await.unwrap();
        assert_eq!(drain(&mut stream).await, ": heartbeat\n\nid: 1\ndata: hello\n\n");
    }

    #[tokio::test]
    async fn classification_errors_surface_to_caller() {
        let (session, _stream) = StreamSession::create(4);
        assert!(matches!(
            session.send(Source::Empty).await,
            Err(Error::EmptySource)
        ));
        assert!(matches!(
            session
                .send(Source::Callable {
                    kind: "function".into()
                })
                .await,
            Err(Error::UnsupportedSource { .. })
        ));
        assert_eq!(session.last_event_id(), 0);
        assert!(!session.mutex.is_locked());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_produce_whole_frames_in_order() {
        let (session, mut stream) = StreamSession::create(256);
        let mut handles = Vec::new();
        for i in 0..50 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                session.send(format!("payload-{i}-{}", "x".repeat(64))).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_some());
        }

        let text = drain(&mut stream).await;
        let frames: Vec<&str> = text.split_terminator("\n\n").collect();
        assert_eq!(frames.len(), 50);
        for (i, frame) in frames.iter().enumerate() {
            let mut lines = frame.lines();
            assert_eq!(lines.next(), Some(format!("id: {}", i + 1).as_str()));
            let data = lines.next().unwrap();
            assert!(data.starts_with("data: payload-"), "torn frame: {frame:?}");
            assert_eq!(lines.next(), None);
        }
    }

    #[tokio::test]
    async fn queued_sends_get_ids_in_call_order() {
        let (session, mut stream) = StreamSession::create(16);
        let held = session.mutex.acquire().await;

        let release = async {
            while session.mutex.waiting() < 3 {
                tokio::task::yield_now().await;
            }
            drop(held);
        };
        let (a, b, c, ()) = tokio::join!(
            session.send("a"),
            session.send("b"),
            session.send("c"),
            release
        );

        assert_eq!(a.unwrap(), Some(1));
        assert_eq!(b.unwrap(), Some(2));
        assert_eq!(c.unwrap(), Some(3));
        assert_eq!(
            drain(&mut stream).await,
            "id: 1\ndata: a\n\nid: 2\ndata: b\n\nid: 3\ndata: c\n\n"
        );
    }

    #[tokio::test]
    async fn raw_marker_consumes_an_id() {
        let (session, mut stream) = StreamSession::create(4);
        assert_eq!(session.send(Source::RawStream).await.unwrap(), Some(1));
        assert_eq!(session.send("next").await.unwrap(), Some(2));
        assert_eq!(drain(&mut stream).await, "id: 1\nid: 2\ndata: next\n\n");
    }

    #[tokio::test]
    async fn write_failure_is_abandoned_and_releases_lock() {
        let (session, stream) = StreamSession::create(4);
        drop(stream);

        assert_eq!(session.send("lost").await.unwrap(), None);
        assert_eq!(session.last_event_id(), 0);
        assert!(!session.mutex.is_locked());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.keep_alive().await);
    }

    #[tokio::test]
    async fn close_unblocks_writer_waiting_on_full_channel() {
        let (session, _stream) = StreamSession::create(1);
        session.send("fills the buffer").await.unwrap();

        let blocked = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("blocked").await }
        });
        tokio::task::yield_now().await;
        session.close();

        assert_eq!(blocked.await.unwrap().unwrap(), None);
        assert_eq!(session.last_event_id(), 1);
        assert!(!session.mutex.is_locked());
    }

    #[tokio::test]
    async fn sink_raw_relays_bytes_unframed() {
        let (session, mut stream) = StreamSession::create(16);
        let source = tokio_stream::iter(vec![
            Ok::<_, BoxError>(Bytes::from_static(b"id: 9\ndata: up")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"stream\n\n")),
        ]);
        assert_eq!(session.sink_raw(source).await.unwrap(), 22);
        assert_eq!(drain(&mut stream).await, "id: 9\ndata: upstream\n\n");
        assert_eq!(session.last_event_id(), 0);
    }

    #[tokio::test]
    async fn sink_raw_drain_failure_keeps_session_usable() {
        let (session, mut stream) = StreamSession::create(16);
        let source = tokio_stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err("upstream reset"),
        ]);
        let err = session.sink_raw(source).await.unwrap_err();
        assert!(matches!(err, Error::DrainFailure(ref msg) if msg == "upstream reset"));
        assert!(!session.mutex.is_locked());

        assert_eq!(session.send("after").await.unwrap(), Some(1));
        assert_eq!(drain(&mut stream).await, "partial\n\nid: 1\ndata: after\n\n");
    }

    #[tokio::test]
    async fn drain_failure_mid_frame_does_not_tear_next_frame() {
        let (session, mut stream) = StreamSession::create(16);
        let source = tokio_stream::iter(vec![
            Ok(Bytes::from_static(b"id: 7\ndata: half")),
            Err("reset"),
        ]);
        assert!(session.sink_raw(source).await.is_err());
        session.send("after").await.unwrap();

        let wire = drain(&mut stream).await;
        assert_eq!(wire, "id: 7\ndata: half\n\nid: 1\ndata: after\n\n");
        let frames: Vec<&str> = wire.split_terminator("\n\n").collect();
        assert_eq!(frames, ["id: 7\ndata: half", "id: 1\ndata: after"]);
    }

    #[tokio::test]
    async fn drain_failure_completes_half_terminated_frame() {
        let (session, mut stream) = StreamSession::create(16);
        let source = tokio_stream::iter(vec![
            Ok(Bytes::from_static(b"id: 7\n")),
            Ok(Bytes::from_static(b"data: x\n")),
            Err("reset"),
        ]);
        assert!(session.sink_raw(source).await.is_err());
        session.send("after").await.unwrap();
        assert_eq!(
            drain(&mut stream).await,
            "id: 7\ndata: x\n\nid: 1\ndata: after\n\n"
        );
    }

    #[tokio::test]
    async fn drain_failure_after_whole_frames_adds_nothing() {
        let (session, mut stream) = StreamSession::create(16);
        let source = tokio_stream::iter(vec![
            Ok(Bytes::from_static(b"id: 7\ndata: x\n")),
            Ok(Bytes::from_static(b"\n")),
            Err("reset"),
        ]);
        assert!(session.sink_raw(source).await.is_err());
        assert_eq!(drain(&mut stream).await, "id: 7\ndata: x\n\n");
    }

    #[test]
    fn trailing_newlines_spans_chunks() {
        assert_eq!(trailing_newlines(2, b"data: x"), 0);
        assert_eq!(trailing_newlines(0, b"\n"), 1);
        assert_eq!(trailing_newlines(1, b"\n"), 2);
        assert_eq!(trailing_newlines(1, b"x\n"), 1);
        assert_eq!(trailing_newlines(0, b"\n\n\n"), 2);
    }

    #[tokio::test]
    async fn sink_raw_blocks_other_producers_until_drained() {
        let (session, mut stream) = StreamSession::create(16);
        let (chunk_tx, chunk_rx) = mpsc::channel::<std::result::Result<Bytes, BoxError>>(4);

        let relay = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.sink_raw(ReceiverStream::new(chunk_rx)).await }
        });
        chunk_tx.send(Ok(Bytes::from_static(b"id: 100\n"))).await.unwrap();
        while !session.mutex.is_locked() {
            tokio::task::yield_now().await;
        }

        let sender = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send("queued").await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!sender.is_finished());

        chunk_tx.send(Ok(Bytes::from_static(b"data: relayed\n\n"))).await.unwrap();
        drop(chunk_tx);
        relay.await.unwrap().unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), Some(1));
        assert_eq!(
            drain(&mut stream).await,
            "id: 100\ndata: relayed\n\nid: 1\ndata: queued\n\n"
        );
    }

    #[tokio::test]
    async fn pipe_skips_sources_without_body() {
        let (session, mut stream) = StreamSession::create(16);
        let relayed = session
            .pipe([
                ResponseSource::empty(),
                ResponseSource::new(BodyHandle::from_chunks(["id: 1\n", "data: b\n\n"])),
            ])
            .await;
        assert_eq!(relayed, 15);
        assert_eq!(drain(&mut stream).await, "id: 1\ndata: b\n\n");
    }

    #[tokio::test]
    async fn pipe_skips_locked_body() {
        let (session, mut stream) = StreamSession::create(16);
        let busy = BodyHandle::from_chunks(["busy"]);
        let _reader = busy.reader().unwrap();

        let relayed = session
            .pipe([
                ResponseSource::new(busy.clone()),
                ResponseSource::new(BodyHandle::from_chunks(["free"])),
            ])
            .await;
        assert_eq!(relayed, 4);
        assert_eq!(drain(&mut stream).await, "free");
    }

    #[tokio::test]
    async fn pipe_stops_at_first_failure_without_error() {
        let (session, mut stream) = StreamSession::create(16);
        let failing = ResponseSource::from_stream(tokio_stream::iter(vec![
            Ok(Bytes::from_static(b"one")),
            Err("reset"),
        ]));
        let relayed = session
            .pipe([
                failing,
                ResponseSource::new(BodyHandle::from_chunks(["never"])),
            ])
            .await;
        assert_eq!(relayed, 0);
        assert_eq!(drain(&mut stream).await, "one\n\n");
        assert!(!session.mutex.is_locked());
    }

    #[tokio::test]
    async fn sessions_do_not_block_each_other() {
        let (one, _one_stream) = StreamSession::create(16);
        let (two, mut two_stream) = StreamSession::create(16);
        let (_chunk_tx, chunk_rx) = mpsc::channel::<std::result::Result<Bytes, BoxError>>(1);

        let _relay = tokio::spawn({
            let one = Arc::clone(&one);
            async move { one.sink_raw(ReceiverStream::new(chunk_rx)).await }
        });
        while !one.mutex.is_locked() {
            tokio::task::yield_now().await;
        }

        let id = tokio::time::timeout(Duration::from_secs(1), two.send("free"))
            .await
            .expect("session two blocked by session one")
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(drain(&mut two_stream).await, "id: 1\ndata: free\n\n");
    }

    #[tokio::test]
    async fn idle_for_resets_on_write() {
        let (session, _stream) = StreamSession::create(4);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.idle_for() >= Duration::from_millis(30));
        session.send("tick").await.unwrap();
        assert!(session.idle_for() < Duration::from_millis(30));
    }
}
