//! SSE frame codec and payload classification.
//!
//! Wire format, one frame per committed write:
//!
//! ```text
//! id: <n>
//! event: <name>        (optional)
//! data: <line>         (one per payload line)
//!
//! ```
//!
//! A raw-stream marker or empty payload encodes as the degenerate `id: <n>\n`.
//! Heartbeats are the comment frame `: heartbeat\n\n` and carry no id.

use std::fmt::{self, Write};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Comment frame used to keep idle connections open.
const HEARTBEAT: &[u8] = b": heartbeat\n\n";

/// Payload tag carried by a [`Chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    Text,
    Json,
    Binary,
    RawStream,
}

impl Variant {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Binary => "binary",
            Self::RawStream => "raw-stream",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything a producer may hand to a session before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Null or missing value.
    Empty,
    /// Raw byte buffer; decoded as UTF-8 text before anything else.
    Bytes(Bytes),
    Text(String),
    /// Structured value. `Value::Null` counts as empty.
    Value(Value),
    /// Pass-through marker for an already framed relay.
    RawStream,
    /// A callable or other value that has no wire form.
    Callable { kind: String },
}

impl From<&str> for Source {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<String> for Source {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for Source {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Source {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Source {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<Value> for Source {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Source {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Empty, Into::into)
    }
}

/// A classified payload ready for framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    #[serde(rename = "type")]
    pub variant: Variant,
    pub data: String,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            variant: Variant::Text,
            data: text.into(),
        }
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self {
            variant: Variant::Json,
            data: serde_json::to_string(value)?,
        })
    }

    /// Bytes rendered as a comma-separated list of decimal octets.
    pub fn binary(bytes: &[u8]) -> Self {
        let mut data = String::with_capacity(bytes.len() * 4);
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                data.push(',');
            }
            let _ = write!(data, "{b}");
        }
        Self {
            variant: Variant::Binary,
            data,
        }
    }

    pub const fn raw_stream() -> Self {
        Self {
            variant: Variant::RawStream,
            data: String::new(),
        }
    }

    /// Whether this chunk encodes as the degenerate `id:`-only frame.
    pub fn is_marker(&self) -> bool {
        self.variant == Variant::RawStream || self.data.is_empty()
    }
}

/// Quick shape test: `{...}` or `[...]`.
pub fn looks_like_json(text: &str) -> bool {
    (text.starts_with('{') && text.ends_with('}'))
        || (text.starts_with('[') && text.ends_with(']'))
}

fn classify_text(text: String) -> Chunk {
    if looks_like_json(&text) {
        Chunk {
            variant: Variant::Json,
            data: text,
        }
    } else {
        Chunk::text(text)
    }
}

/// Classify a producer value into a [`Chunk`].
///
/// Byte buffers are decoded as text first, then the JSON shape test runs on
/// the decoded text. Buffers that are not valid UTF-8 become `binary`.
/// Objects and arrays are serialized and tagged `json`; other scalars are
/// stringified as `text`.
pub fn classify(source: Source) -> Result<Chunk> {
    match source {
        Source::Empty | Source::Value(Value::Null) => Err(Error::EmptySource),
        Source::Callable { kind } => Err(Error::UnsupportedSource { kind }),
        Source::RawStream => Ok(Chunk::raw_stream()),
        Source::Bytes(bytes) => match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(classify_text(text.to_owned())),
            Err(_) => Ok(Chunk::binary(&bytes)),
        },
        Source::Text(text) | Source::Value(Value::String(text)) => Ok(classify_text(text)),
        Source::Value(value @ (Value::Object(_) | Value::Array(_))) => Chunk::json(&value),
        Source::Value(value) => Ok(Chunk::text(value.to_string())),
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub id: u64,
    pub event: Option<&'a str>,
    pub chunk: &'a Chunk,
}

impl<'a> Frame<'a> {
    pub const fn new(id: u64, chunk: &'a Chunk) -> Self {
        Self {
            id,
            event: None,
            chunk,
        }
    }

    pub const fn named(id: u64, event: &'a str, chunk: &'a Chunk) -> Self {
        Self {
            id,
            event: Some(event),
            chunk,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.chunk.data.len() + 32);
        let _ = writeln!(out, "id: {}", self.id);
        if self.chunk.is_marker() {
            return Bytes::from(out);
        }

        if let Some(event) = self.event {
            out.push_str("event: ");
            out.extend(event.chars().filter(|c| !matches!(c, '\r' | '\n')));
            out.push('\n');
        }
        for line in payload_lines(&self.chunk.data) {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Split a payload on any of `\r\n`, `\r`, `\n` so no line break survives
/// inside a `data:` field.
fn payload_lines(data: &str) -> impl Iterator<Item = &str> {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let current = rest?;
        match current.find(['\r', '\n']) {
            Some(pos) => {
                let skip = if current[pos..].starts_with("\r\n") { 2 } else { 1 };
                rest = Some(&current[pos + skip..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

/// Encode a frame with no event name.
pub fn encode(id: u64, chunk: &Chunk) -> Bytes {
    Frame::new(id, chunk).encode()
}

/// The comment-only heartbeat frame. Allocates no id.
pub const fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT)
}
