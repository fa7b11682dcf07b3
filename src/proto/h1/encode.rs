//! Request body encoders.

use std::fmt;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::io::Buffered;

/// Chunked uploads are split so no single chunk exceeds this.
pub(crate) const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// Encoders to handle different Transfer-Encodings.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Clone, Debug, PartialEq)]
enum Kind {
    /// An encoder for when Content-Length is known.
    ///
    /// Enforces that the body is not longer than the Content-Length header.
    Length(u64),
    /// An encoder for `Transfer-Encoding: chunked`.
    Chunked,
    /// No body is allowed or expected.
    Empty,
}

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Encoder {
        Encoder { kind: Kind::Chunked }
    }

    pub(crate) fn empty() -> Encoder {
        Encoder { kind: Kind::Empty }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked)
    }

    /// True once the promised length (if any) is fully written.
    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.kind, Kind::Length(0) | Kind::Empty)
    }

    /// Buffers one piece of the body, splitting oversized chunks.
    pub(crate) async fn encode<T>(&mut self, io: &mut Buffered<T>, data: Bytes) -> io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if data.is_empty() {
            return Ok(());
        }
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if (data.len() as u64) > *remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        BodyTooLong,
                    ));
                }
                *remaining -= data.len() as u64;
                io.buffer(&data);
                io.flush().await
            }
            Kind::Chunked => {
                let mut rest = data;
                while !rest.is_empty() {
                    let chunk = rest.split_to(std::cmp::min(MAX_CHUNK_SIZE, rest.len()));
                    trace!("encoding chunk of {}B", chunk.len());
                    let mut size = [0u8; 16];
                    let size = hex(chunk.len(), &mut size);
                    io.buffer(size);
                    io.buffer(b"\r\n");
                    io.buffer(&chunk);
                    io.buffer(b"\r\n");
                }
                io.flush().await
            }
            Kind::Empty => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unexpected body for bodiless message",
            )),
        }
    }

    /// Finishes the body: the terminating chunk for chunked encoding, a
    /// completeness check for known lengths.
    pub(crate) async fn finish<T>(&mut self, io: &mut Buffered<T>) -> io::Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match self.kind {
            Kind::Length(0) | Kind::Empty => Ok(()),
            Kind::Length(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, BodyTooShort)),
            Kind::Chunked => {
                io.buffer(b"0\r\n\r\n");
                io.flush().await
            }
        }
    }
}

fn hex(mut n: usize, buf: &mut [u8; 16]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    if n == 0 {
        buf[15] = b'0';
        return &buf[15..];
    }
    let mut i = 16;
    while n > 0 {
        i -= 1;
        buf[i] = DIGITS[n % 16];
        n /= 16;
    }
    &buf[i..]
}

#[derive(Debug)]
struct BodyTooLong;

impl fmt::Display for BodyTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("body longer than its content-length")
    }
}

impl std::error::Error for BodyTooLong {}

#[derive(Debug)]
struct BodyTooShort;

impl fmt::Display for BodyTooShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("body shorter than its content-length")
    }
}

impl std::error::Error for BodyTooShort {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn chunked_writes_hex_sizes_and_terminator() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut io = Buffered::new(client);
        let mut encoder = Encoder::chunked();
        encoder
            .encode(&mut io, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        encoder.finish(&mut io).await.unwrap();
        drop(io);

        let mut out = Vec::new();
        let mut server = server;
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn chunked_splits_large_chunks() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut io = Buffered::new(client);
        let mut encoder = Encoder::chunked();
        let big = Bytes::from(vec![b'x'; MAX_CHUNK_SIZE + 1]);
        encoder.encode(&mut io, big).await.unwrap();
        encoder.finish(&mut io).await.unwrap();
        drop(io);

        let mut out = Vec::new();
        let mut server = server;
        server.read_to_end(&mut out).await.unwrap();
        assert!(out.starts_with(b"4000\r\n"));
        let tail = &out[6 + MAX_CHUNK_SIZE + 2..];
        assert!(tail.starts_with(b"1\r\nx\r\n"));
    }

    #[tokio::test]
    async fn length_encoder_enforces_exact_length() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut io = Buffered::new(client);
        let mut encoder = Encoder::length(4);
        encoder
            .encode(&mut io, Bytes::from_static(b"1234"))
            .await
            .unwrap();
        assert!(encoder.is_complete());
        assert!(encoder
            .encode(&mut io, Bytes::from_static(b"5"))
            .await
            .is_err());

        let mut short = Encoder::length(4);
        assert!(short.finish(&mut io).await.is_err());
    }
}
