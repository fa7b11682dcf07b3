//! Streaming bodies for requests and responses.
//!
//! Request bodies are either replayable in-memory values or one-shot
//! channel streams; the retry interceptor refuses to replay a one-shot
//! body once transmission has begun. Response bodies are pulled a chunk at
//! a time and keep their exchange (and its connection borrow) alive until
//! fully consumed or dropped.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_channel::mpsc;
use futures_util::StreamExt;

use crate::error::{Error, Result};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A request body.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Bytes),
    /// A streamed body fed by a [`Sender`]. Always one-shot.
    Channel {
        content_length: Option<u64>,
        rx: mpsc::Receiver<Result<Bytes>>,
    },
}

/// Feeds chunks into a channel [`Body`].
pub struct Sender {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl Body {
    /// A body with no content.
    pub fn empty() -> Body {
        Body { kind: Kind::Empty }
    }

    /// A streaming body fed through the returned [`Sender`].
    ///
    /// Channel bodies are one-shot: once transmission has begun the retry
    /// layer will not replay them.
    pub fn channel(content_length: Option<u64>) -> (Sender, Body) {
        let (tx, rx) = mpsc::channel(0);
        (
            Sender { tx },
            Body {
                kind: Kind::Channel { content_length, rx },
            },
        )
    }

    /// The number of bytes that will be written, if known.
    pub fn content_length(&self) -> Option<u64> {
        match self.kind {
            Kind::Empty => Some(0),
            Kind::Full(ref bytes) => Some(bytes.len() as u64),
            Kind::Channel { content_length, .. } => content_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::Empty) || matches!(self.kind, Kind::Full(ref b) if b.is_empty())
    }

    /// One-shot bodies can only be transmitted once.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, Kind::Channel { .. })
    }

    /// A second transmission of this body, if it is replayable.
    pub(crate) fn try_replay(&self) -> Option<Body> {
        match self.kind {
            Kind::Empty => Some(Body::empty()),
            Kind::Full(ref bytes) => Some(Body {
                kind: Kind::Full(bytes.clone()),
            }),
            Kind::Channel { .. } => None,
        }
    }

    /// Pulls the next chunk to transmit, `None` on end of body.
    pub(crate) async fn data(&mut self) -> Option<Result<Bytes>> {
        match self.kind {
            Kind::Empty => None,
            Kind::Full(ref mut bytes) => {
                if bytes.is_empty() {
                    None
                } else {
                    Some(Ok(std::mem::take(bytes)))
                }
            }
            Kind::Channel { ref mut rx, .. } => rx.next().await,
        }
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body {
            kind: Kind::Full(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::from(Bytes::from(vec))
    }
}

impl From<&'static [u8]> for Body {
    fn from(slice: &'static [u8]) -> Body {
        Body::from(Bytes::from_static(slice))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Empty => f.write_str("Body(Empty)"),
            Kind::Full(ref b) => write!(f, "Body(Full, {} bytes)", b.len()),
            Kind::Channel { .. } => f.write_str("Body(Channel)"),
        }
    }
}

impl Sender {
    /// Sends one chunk, waiting for the transmitter to want it.
    pub async fn send_data(&mut self, chunk: Bytes) -> Result<()> {
        use futures_util::SinkExt;
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| Error::new_closed())
    }

    /// Aborts the body with an error; the call fails with a write error.
    pub fn abort(mut self) {
        let _ = self
            .tx
            .try_send(Err(Error::new_body_write("body write aborted")));
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish()
    }
}

// ===== response bodies =====

/// A pull source of response chunks. Implementations own whatever keeps
/// the bytes flowing: the HTTP/1 codec and its pool guard, or an HTTP/2
/// stream handle.
pub(crate) trait ChunkSource: Send {
    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>>;
}

/// A streaming response body.
///
/// Dropping the body before it is exhausted releases the underlying
/// exchange; for HTTP/1 that costs the connection its reusability.
pub struct ResponseBody {
    content_length: Option<u64>,
    kind: RespKind,
}

enum RespKind {
    Empty,
    Full(Bytes),
    Streamed(Box<dyn ChunkSource>),
}

impl ResponseBody {
    pub(crate) fn empty() -> ResponseBody {
        ResponseBody {
            content_length: Some(0),
            kind: RespKind::Empty,
        }
    }

    pub(crate) fn full(bytes: Bytes) -> ResponseBody {
        ResponseBody {
            content_length: Some(bytes.len() as u64),
            kind: RespKind::Full(bytes),
        }
    }

    pub(crate) fn streamed(
        content_length: Option<u64>,
        source: Box<dyn ChunkSource>,
    ) -> ResponseBody {
        ResponseBody {
            content_length,
            kind: RespKind::Streamed(source),
        }
    }

    /// The value of `Content-Length`, or `None` when the length is unknown
    /// (chunked, read-to-close, or a decoded encoding).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Pulls the next chunk, `None` once the body is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self.kind {
            RespKind::Empty => Ok(None),
            RespKind::Full(ref mut bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            RespKind::Streamed(ref mut source) => source.next_chunk().await,
        }
    }

    /// Reads the remainder of the body into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            self.content_length.map(|n| n as usize).unwrap_or(8 * 1024),
        );
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Reads the remainder of the body and decodes it as UTF-8, lossily.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RespKind::Empty => "Empty",
            RespKind::Full(_) => "Full",
            RespKind::Streamed(_) => "Streamed",
        };
        f.debug_struct("ResponseBody")
            .field("kind", &kind)
            .field("content_length", &self.content_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_body_yields_once() {
        let mut body = Body::from("hello");
        assert_eq!(body.content_length(), Some(5));
        assert!(!body.is_one_shot());
        let chunk = body.data().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.data().await.is_none());
    }

    #[tokio::test]
    async fn replay_restores_full_bodies_only() {
        let body = Body::from("hello");
        assert!(body.try_replay().is_some());
        let (_tx, chan) = Body::channel(None);
        assert!(chan.try_replay().is_none());
        assert!(chan.is_one_shot());
    }

    #[tokio::test]
    async fn channel_body_streams_chunks() {
        let (mut tx, mut body) = Body::channel(Some(10));
        let write = tokio::spawn(async move {
            tx.send_data(Bytes::from_static(b"hello ")).await.unwrap();
            tx.send_data(Bytes::from_static(b"world")).await.unwrap();
        });
        let mut all = Vec::new();
        while let Some(chunk) = body.data().await {
            all.extend_from_slice(&chunk.unwrap());
        }
        write.await.unwrap();
        assert_eq!(all, b"hello world");
    }

    #[tokio::test]
    async fn response_body_collects() {
        let body = ResponseBody::full(Bytes::from_static(b"abc"));
        assert_eq!(body.bytes().await.unwrap(), Bytes::from_static(b"abc"));
    }
}
