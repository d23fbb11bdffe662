use std::convert::Infallible;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use ssemux_core::pulse::keep_alive_pulse;
use ssemux_core::{Error, RegistryError, SessionRegistry};

/// Response header carrying the session's stream id.
pub const STREAM_ID_HEADER: &str = "x-stream-id";

const DEFAULT_PULSE_MS: u64 = 15_000;
const MIN_PULSE_MS: u64 = 100;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// Cancelled on server shutdown; ends open pulse streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            shutdown: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(rename = "streamId")]
    stream_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PulseQuery {
    interval: Option<u64>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", post(post_stream).get(attach_stream))
        .route("/keep-alive", get(keep_alive))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// "No handler matched" for bad or unknown stream ids.
fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

/// Stream ids are UUIDs; anything else is treated as unknown.
fn parse_stream_id(raw: &str) -> Option<String> {
    uuid::Uuid::parse_str(raw).ok().map(|id| id.to_string())
}

/// Returns true if the client asked for an event stream.
fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Wrap a byte stream in an SSE response.
fn event_stream_response(body: Body, stream_id: Option<&str>) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(value) = stream_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(STREAM_ID_HEADER, value);
    }
    response
}

/// `POST /stream` creates a session; `POST /stream?streamId=` feeds one.
pub async fn post_stream(
    State(state): State<AppState>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    body: Body,
) -> Response {
    match query {
        Ok(Query(StreamQuery { stream_id: None })) => create_stream(&state).await,
        Ok(Query(StreamQuery {
            stream_id: Some(raw),
        })) => match parse_stream_id(&raw) {
            Some(stream_id) => feed_stream(&state, &stream_id, body).await,
            None => not_found(),
        },
        Err(_) => not_found(),
    }
}

async fn create_stream(state: &AppState) -> Response {
    let session = state.registry.create().await;
    if let Err(e) = session.send(json!({"status": "init"})).await {
        warn!(stream_id = %session.stream_id(), error = %e, "Failed to queue init frame");
    }
    let stream_id = session.stream_id().to_string();
    (
        [(STREAM_ID_HEADER, stream_id.clone())],
        Json(json!({ "streamId": stream_id })),
    )
        .into_response()
}

async fn feed_stream(state: &AppState, stream_id: &str, body: Body) -> Response {
    let Some(session) = state.registry.get(stream_id).await else {
        return not_found();
    };
    match session.sink_raw(body.into_data_stream()).await {
        Ok(relayed) => {
            debug!(stream_id, relayed, "Feed relayed");
            StatusCode::ACCEPTED.into_response()
        }
        Err(Error::DrainFailure(e)) => (StatusCode::BAD_GATEWAY, e).into_response(),
        Err(e) => (StatusCode::GONE, e.to_string()).into_response(),
    }
}

/// `GET /stream?streamId=` with `Accept: text/event-stream`: the session's
/// byte channel as the response body.
pub async fn attach_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Response {
    if !wants_event_stream(&headers) {
        return not_found();
    }
    let Some(stream_id) = query
        .ok()
        .and_then(|Query(q)| q.stream_id)
        .and_then(|raw| parse_stream_id(&raw))
    else {
        return not_found();
    };
    let Some(session) = state.registry.get(&stream_id).await else {
        return not_found();
    };

    let events = match state.registry.attach(&stream_id).await {
        Ok(events) => events,
        Err(RegistryError::AlreadyAttached { .. }) => {
            return (StatusCode::CONFLICT, "Stream already attached").into_response();
        }
        Err(RegistryError::SessionNotFound { .. }) => return not_found(),
    };

    if !session.has_active_consumer() {
        // Queued from a task: the reader only starts draining once this
        // response is returned.
        tokio::spawn(async move {
            if let Err(e) = session.send(json!({"status": "connected"})).await {
                warn!(stream_id = %session.stream_id(), error = %e, "Failed to queue connected frame");
            }
        });
    }

    info!(stream_id = %stream_id, "Client attached");
    event_stream_response(
        Body::from_stream(events.map(Ok::<_, Infallible>)),
        Some(&stream_id),
    )
}

/// `GET /keep-alive?interval=<ms>`: standalone keep-alive pulse.
pub async fn keep_alive(
    State(state): State<AppState>,
    query: Result<Query<PulseQuery>, QueryRejection>,
) -> Response {
    let interval_ms = query
        .ok()
        .and_then(|Query(q)| q.interval)
        .unwrap_or(DEFAULT_PULSE_MS)
        .max(MIN_PULSE_MS);
    let pulse = keep_alive_pulse(
        Duration::from_millis(interval_ms),
        state.shutdown.child_token(),
    );
    event_stream_response(Body::from_stream(pulse.map(Ok::<_, Infallible>)), None)
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.registry.session_count().await;
    Json(json!({ "status": "ok", "sessions": sessions }))
}
