//! Standalone keep-alive pulse stream.
//!
//! Unlike the session heartbeat comment, a pulse is a real named event with
//! its own id sequence, meant to be served as a whole response body:
//!
//! ```text
//! id: 0
//! event: keep-alive
//! data: {"id":0,"createdAt":"2024-05-01T12:00:00.000Z","timestamp":"...","type":"keep-alive"}
//!
//! ```

use std::time::Duration;

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Chunk, Frame};

/// Event name carried by every pulse frame.
pub const KEEP_ALIVE_EVENT: &str = "keep-alive";

/// Payload of one pulse. Timestamps are RFC 3339 UTC with millisecond
/// precision (`2024-05-01T12:00:00.000Z`).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeepAliveEvent {
    pub id: u64,
    pub created_at: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encode one pulse event as a frame.
pub fn encode_pulse(event: &KeepAliveEvent) -> Option<Bytes> {
    match Chunk::json(event) {
        Ok(chunk) => Some(Frame::named(event.id, KEEP_ALIVE_EVENT, &chunk).encode()),
        Err(e) => {
            warn!(error = %e, "Failed to encode keep-alive event");
            None
        }
    }
}

/// Emit a keep-alive frame every `interval` until `shutdown` is cancelled or
/// the consumer drops the stream. The first frame arrives after one full
/// interval.
pub fn keep_alive_pulse(
    interval: Duration,
    shutdown: CancellationToken,
) -> impl Stream<Item = Bytes> + Send + 'static {
    async_stream::stream! {
        let created_at = now_rfc3339();
        let mut id = 0u64;
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = shutdown.cancelled() => {
                    debug!(sent = id, "Keep-alive pulse stopped");
                    break;
                }
            }
            let event = KeepAliveEvent {
                id,
                created_at: created_at.clone(),
                timestamp: now_rfc3339(),
                kind: KEEP_ALIVE_EVENT,
            };
            id += 1;
            if let Some(frame) = encode_pulse(&event) {
                yield frame;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    #[test]
    fn pulse_frame_layout() {
        let event = KeepAliveEvent {
            id: 3,
            created_at: "2024-05-01T12:00:00.000Z".into(),
            timestamp: "2024-05-01T12:00:15.000Z".into(),
            kind: KEEP_ALIVE_EVENT,
        };
        let frame = encode_pulse(&event).unwrap();
        assert_eq!(
            &frame[..],
            b"id: 3\nevent: keep-alive\ndata: {\"id\":3,\"createdAt\":\"2024-05-01T12:00:00.000Z\",\"timestamp\":\"2024-05-01T12:00:15.000Z\",\"type\":\"keep-alive\"}\n\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_ids_start_at_zero_and_increase() {
        let shutdown = CancellationToken::new();
        let pulse = keep_alive_pulse(Duration::from_millis(250), shutdown.clone());
        tokio::pin!(pulse);

        for expected in 0..3 {
            let frame = pulse.next().await.unwrap();
            let text = std::str::from_utf8(&frame).unwrap();
            assert!(text.starts_with(&format!("id: {expected}\nevent: keep-alive\n")), "{text}");
            assert!(text.contains("\"type\":\"keep-alive\""));
        }

        shutdown.cancel();
        assert!(pulse.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_timestamps_are_rfc3339() {
        let pulse = keep_alive_pulse(Duration::from_millis(100), CancellationToken::new());
        tokio::pin!(pulse);

        let frame = pulse.next().await.unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        let event: serde_json::Value = serde_json::from_str(data).unwrap();
        for field in ["createdAt", "timestamp"] {
            let stamp = event[field].as_str().unwrap();
            assert!(stamp.ends_with('Z'), "{stamp}");
            chrono::DateTime::parse_from_rfc3339(stamp).unwrap();
        }
    }
}
