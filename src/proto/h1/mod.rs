//! The HTTP/1.1 client codec.
//!
//! One codec per connection. An exchange drives it through one
//! `idle → writing-request → reading-response → idle` cycle; any parse
//! error or truncated message moves it to `closed`, and the connection is
//! then poisoned against further exchanges.

pub(crate) use self::decode::Decoder;
pub(crate) use self::encode::Encoder;
pub(crate) use self::io::Buffered;

mod decode;
mod encode;
mod io;
pub(crate) mod role;

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::proto::{BodyLength, RequestHead, ResponseHead, DEFAULT_MAX_BUFFER_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    WritingRequest,
    ReadingResponse,
    ReadingBody,
    Closed,
}

pub(crate) struct Http1Codec<T> {
    io: Buffered<T>,
    state: State,
    encoder: Encoder,
}

impl<T> Http1Codec<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T) -> Http1Codec<T> {
        Http1Codec {
            io: Buffered::new(io),
            state: State::Idle,
            encoder: Encoder::empty(),
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    pub(crate) fn close(&mut self) {
        self.state = State::Closed;
    }

    pub(crate) fn io_ref(&self) -> &T {
        self.io.io_ref()
    }

    /// Writes the request line and headers, arming the body encoder.
    pub(crate) async fn write_request_head(
        &mut self,
        head: &RequestHead,
        body_len: BodyLength,
    ) -> Result<()> {
        debug_assert_eq!(self.state, State::Idle, "request on busy codec");
        self.state = State::WritingRequest;

        self.encoder = match body_len {
            BodyLength::None => Encoder::empty(),
            BodyLength::Known(n) => Encoder::length(n),
            BodyLength::Chunked => Encoder::chunked(),
            BodyLength::CloseDelimited => {
                // Requests cannot be close-delimited.
                self.state = State::Closed;
                return Err(Error::new(crate::error::Kind::Parse(
                    crate::error::Parse::TransferEncodingUnexpected,
                )));
            }
        };

        let mut dst = BytesMut::new();
        role::encode_request(head, &mut dst);
        self.io.buffer(&dst);
        self.io.flush().await.map_err(|e| self.fatal(e))?;
        Ok(())
    }

    pub(crate) async fn write_body(&mut self, data: Bytes) -> Result<()> {
        debug_assert_eq!(self.state, State::WritingRequest);
        self.encoder
            .encode(&mut self.io, data)
            .await
            .map_err(|e| self.fatal_write(e))
    }

    pub(crate) async fn finish_body(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, State::WritingRequest);
        self.encoder
            .finish(&mut self.io)
            .await
            .map_err(|e| self.fatal_write(e))?;
        self.state = State::ReadingResponse;
        Ok(())
    }

    /// Waits up to `window` for the server to say something after an
    /// `Expect: 100-continue` request head.
    ///
    /// `true` means go ahead and send the body (a `100` arrived, or the
    /// server stayed silent); `false` means a final response is already
    /// buffered and the body should be skipped.
    pub(crate) async fn await_continue(&mut self, window: Duration) -> Result<bool> {
        debug_assert_eq!(self.state, State::WritingRequest);
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match role::parse_response_peek(self.io.read_buf()).map_err(|e| self.fatal_parse(e))? {
                Some((status, len)) if status == StatusCode::CONTINUE => {
                    let _ = self.io.read_buf_mut().split_to(len);
                    trace!("100-continue received");
                    return Ok(true);
                }
                Some(..) => return Ok(false),
                None => {}
            }
            let fill = tokio::time::timeout_at(deadline, self.io.fill());
            match fill.await {
                Ok(Ok(0)) => return Ok(false),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(self.fatal(e)),
                // Silence: the server is old-school, send the body.
                Err(_elapsed) => return Ok(true),
            }
        }
    }

    /// Reads the next final response head, skipping interim `1xx`
    /// responses other than `101`.
    pub(crate) async fn read_response_head(&mut self) -> Result<ResponseHead> {
        debug_assert!(
            self.state == State::ReadingResponse || self.state == State::WritingRequest,
            "read_response_head in {:?}",
            self.state
        );
        loop {
            match role::parse_response_peek(self.io.read_buf()).map_err(|e| self.fatal_parse(e))? {
                Some((status, len))
                    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS =>
                {
                    debug!("ignoring interim response: {}", status);
                    let _ = self.io.read_buf_mut().split_to(len);
                    continue;
                }
                Some(..) => {
                    let head = role::parse_response(self.io.read_buf_mut())
                        .map_err(|e| self.fatal_parse(e))?
                        .expect("peek found a complete head");
                    self.state = State::ReadingBody;
                    return Ok(head);
                }
                None => {}
            }
            if self.io.read_buf().len() > DEFAULT_MAX_BUFFER_SIZE {
                self.state = State::Closed;
                return Err(Error::new_too_large());
            }
            match self.io.fill().await {
                Ok(0) => {
                    self.state = State::Closed;
                    return Err(Error::new_incomplete());
                }
                Ok(_) => {}
                Err(e) => return Err(self.fatal(e)),
            }
        }
    }

    pub(crate) async fn read_body(&mut self, decoder: &mut Decoder) -> Result<Bytes> {
        debug_assert_eq!(self.state, State::ReadingBody);
        decoder.decode(&mut self.io).await.map_err(|e| {
            self.state = State::Closed;
            Error::new_body(e)
        })
    }

    /// Completes the exchange. Reusable only if the body was fully decoded
    /// and nothing poisoned the codec.
    pub(crate) fn finish_response(&mut self, reusable: bool) {
        if self.state == State::Closed {
            return;
        }
        self.state = if reusable { State::Idle } else { State::Closed };
    }

    /// Tears down into the transport and unparsed bytes, for `101`
    /// upgrades.
    pub(crate) fn into_parts(self) -> (T, Bytes) {
        self.io.into_parts()
    }

    fn fatal(&mut self, err: std::io::Error) -> Error {
        self.state = State::Closed;
        Error::new_io(err)
    }

    fn fatal_write(&mut self, err: std::io::Error) -> Error {
        self.state = State::Closed;
        Error::new_body_write(err)
    }

    fn fatal_parse(&mut self, err: crate::error::Parse) -> Error {
        self.state = State::Closed;
        Error::from(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn head(method: Method, target: &str) -> RequestHead {
        RequestHead {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
        }
    }

    #[tokio::test]
    async fn full_exchange_round_trip() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut codec = Http1Codec::new(client);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"GET /hello HTTP/1.1\r\n"));
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            server
        });

        codec
            .write_request_head(&head(Method::GET, "/hello"), BodyLength::None)
            .await
            .unwrap();
        codec.finish_body().await.unwrap();
        let response = codec.read_response_head().await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let len =
            role::response_body_length(&Method::GET, response.status, &response.headers).unwrap();
        let mut decoder = Decoder::new(len);
        let mut body = Vec::new();
        loop {
            let chunk = codec.read_body(&mut decoder).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"hello");
        codec.finish_response(true);
        assert!(codec.is_idle());

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn interim_responses_are_skipped() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut codec = Http1Codec::new(client);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(
                    b"HTTP/1.1 103 Early Hints\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n",
                )
                .await
                .unwrap();
            // Keep the socket open so EOF is not the signal.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        codec
            .write_request_head(&head(Method::GET, "/"), BodyLength::None)
            .await
            .unwrap();
        codec.finish_body().await.unwrap();
        let response = codec.read_response_head().await.unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn truncated_head_closes_codec() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut codec = Http1Codec::new(client);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"HTTP/1.1 200").await.unwrap();
            // connection dropped mid-head
        });

        codec
            .write_request_head(&head(Method::GET, "/"), BodyLength::None)
            .await
            .unwrap();
        codec.finish_body().await.unwrap();
        let err = codec.read_response_head().await.unwrap_err();
        assert!(err.is_incomplete_message());
        assert!(codec.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn expect_continue_times_out_to_send() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut codec = Http1Codec::new(client);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            // read the head, say nothing
            let _ = server.read(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        codec
            .write_request_head(&head(Method::POST, "/upload"), BodyLength::Known(1))
            .await
            .unwrap();
        let go = codec.await_continue(Duration::from_secs(1)).await.unwrap();
        assert!(go);
    }
}
