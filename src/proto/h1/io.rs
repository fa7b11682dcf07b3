//! Buffered transport for the HTTP/1 codec.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The initial read buffer capacity. Grows on demand up to the codec's
/// configured maximum while a message head is incomplete.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

/// A read+write buffered wrapper around the transport.
///
/// Reads accumulate into `read_buf` so the parser can see a contiguous
/// prefix; writes accumulate into `write_buf` and go out on `flush`.
pub(crate) struct Buffered<T> {
    io: T,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<T> Buffered<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T) -> Buffered<T> {
        Buffered {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
        }
    }

    pub(crate) fn read_buf(&self) -> &[u8] {
        &self.read_buf
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Reads more bytes from the transport into the read buffer.
    ///
    /// Returns the number of new bytes; `0` means EOF.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.io.read_buf(&mut self.read_buf).await
    }

    /// Returns one byte, filling from the transport as needed.
    pub(crate) async fn read_byte(&mut self) -> io::Result<Option<u8>> {
        while self.read_buf.is_empty() {
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
        let byte = self.read_buf[0];
        self.read_buf.advance(1);
        Ok(Some(byte))
    }

    /// Returns up to `max` buffered bytes, filling once from the transport
    /// if the buffer is empty. An empty result means EOF.
    pub(crate) async fn read_mem(&mut self, max: usize) -> io::Result<Bytes> {
        if self.read_buf.is_empty() {
            if self.fill().await? == 0 {
                return Ok(Bytes::new());
            }
        }
        let n = std::cmp::min(max, self.read_buf.len());
        Ok(self.read_buf.split_to(n).freeze())
    }

    /// Queues bytes to be written on the next flush.
    pub(crate) fn buffer(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            let buf = self.write_buf.split().freeze();
            self.io.write_all(&buf).await?;
        }
        self.io.flush().await
    }

    /// Tears down into the transport and any bytes read past the parser.
    pub(crate) fn into_parts(self) -> (T, Bytes) {
        (self.io, self.read_buf.freeze())
    }

    pub(crate) fn io_ref(&self) -> &T {
        &self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffers_writes_until_flush() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut buffered = Buffered::new(client);
        buffered.buffer(b"GET / HTTP/1.1\r\n");
        buffered.buffer(b"\r\n");
        buffered.flush().await.unwrap();

        let mut read = vec![0u8; 18];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut read)
            .await
            .unwrap();
        assert_eq!(&read, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn read_mem_drains_buffer_before_io() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut server, b"abcdef")
            .await
            .unwrap();
        drop(server);

        let mut buffered = Buffered::new(client);
        assert_eq!(&buffered.read_mem(4).await.unwrap()[..], b"abcd");
        assert_eq!(&buffered.read_mem(4).await.unwrap()[..], b"ef");
        assert!(buffered.read_mem(4).await.unwrap().is_empty());
    }
}
