//! Response-like byte sources that a session can relay.
//!
//! A [`BodyHandle`] models a body that can be read by one reader at a time.
//! Taking a [`BodyReader`] locks the body; dropping the reader puts the
//! remaining stream back so another reader may continue.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio_stream::{Stream, StreamExt};

/// Boxed error produced by a relayed body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Shared handle to a readable body.
#[derive(Clone)]
pub struct BodyHandle {
    slot: Arc<Mutex<Option<ByteStream>>>,
}

impl BodyHandle {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let stream: ByteStream = Box::pin(stream.map(|item| item.map_err(Into::into)));
        Self {
            slot: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// A body that yields `chunks` in order and then ends.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::new(tokio_stream::iter(
            chunks.into_iter().map(|c| Ok::<_, BoxError>(c.into())),
        ))
    }

    fn slot(&self) -> MutexGuard<'_, Option<ByteStream>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether another reader currently holds the body.
    pub fn is_locked(&self) -> bool {
        self.slot().is_none()
    }

    /// Lock the body for reading. `None` if it is already being read.
    pub fn reader(&self) -> Option<BodyReader> {
        let stream = self.slot().take()?;
        Some(BodyReader {
            stream: Some(stream),
            slot: Arc::clone(&self.slot),
        })
    }
}

impl fmt::Debug for BodyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyHandle")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Exclusive reader over a [`BodyHandle`]. Releases the body on drop.
pub struct BodyReader {
    stream: Option<ByteStream>,
    slot: Arc<Mutex<Option<ByteStream>>>,
}

impl Stream for BodyReader {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.stream.as_mut() {
            Some(stream) => stream.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
        }
    }
}

/// A response-like source handed to `StreamSession::pipe`.
#[derive(Debug, Clone, Default)]
pub struct ResponseSource {
    pub body: Option<BodyHandle>,
}

impl ResponseSource {
    pub const fn new(body: BodyHandle) -> Self {
        Self { body: Some(body) }
    }

    /// A response without a body.
    pub const fn empty() -> Self {
        Self { body: None }
    }

    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self::new(BodyHandle::new(stream))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_locks_and_releases_body() {
        let body = BodyHandle::from_chunks(["a", "b"]);
        let mut reader = body.reader().unwrap();
        assert!(body.is_locked());
        assert!(body.reader().is_none());

        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        drop(reader);
        assert!(!body.is_locked());

        // The second reader resumes where the first stopped.
        let mut reader = body.reader().unwrap();
        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn empty_source_has_no_body() {
        assert!(ResponseSource::empty().body.is_none());
        assert!(ResponseSource::default().body.is_none());
    }
}
