//! Frame-level reader and writer.
//!
//! The reader assembles complete frames (including CONTINUATION
//! reassembly and HPACK decoding of header blocks); the writer serializes
//! frames and owns the HPACK encoder. One reader and one writer exist per
//! connection.

use std::io;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::frame::{self, Frame, Head, Kind, Pseudo, Settings, HEADER_LEN};
use super::{hpack, H2Error, Reason, DEFAULT_MAX_FRAME_SIZE, PREFACE};

/// A failure while receiving: fatal to the connection, fatal to one
/// stream, or an I/O error.
#[derive(Debug)]
pub(crate) enum RecvError {
    Connection(Reason),
    Stream { id: u32, reason: Reason },
    Io(io::Error),
}

impl From<H2Error> for RecvError {
    fn from(err: H2Error) -> RecvError {
        match err.stream_id() {
            Some(id) => RecvError::Stream {
                id,
                reason: err.reason(),
            },
            None => RecvError::Connection(err.reason()),
        }
    }
}

impl From<io::Error> for RecvError {
    fn from(err: io::Error) -> RecvError {
        RecvError::Io(err)
    }
}

pub(crate) struct FramedRead<T> {
    io: T,
    buf: BytesMut,
    hpack: hpack::Decoder,
    max_frame_size: u32,
    partial: Option<Partial>,
}

/// A headers frame still waiting for CONTINUATION frames.
struct Partial {
    stream_id: u32,
    end_stream: bool,
    fragment: BytesMut,
}

impl<T> FramedRead<T>
where
    T: AsyncRead + Unpin,
{
    pub(crate) fn new(io: T, local_header_table_size: usize) -> FramedRead<T> {
        FramedRead {
            io,
            buf: BytesMut::with_capacity(HEADER_LEN + DEFAULT_MAX_FRAME_SIZE as usize),
            hpack: hpack::Decoder::new(local_header_table_size),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            partial: None,
        }
    }

    pub(crate) fn set_max_frame_size(&mut self, val: u32) {
        self.max_frame_size = val;
    }

    /// Reads the next complete frame. `None` means a clean EOF between
    /// frames.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            let (head, payload) = match self.fill_frame().await? {
                Some(raw) => raw,
                None => return Ok(None),
            };

            trace!("received frame; kind={:?} len={}", head.kind, head.length);

            if self.partial.is_some() && head.kind != Kind::Continuation {
                debug!("expected CONTINUATION, got {:?}", head.kind);
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }

            match head.kind {
                Kind::Data => return self.data_frame(head, payload).map(Some),
                Kind::Headers => {
                    if let Some(frame) = self.headers_frame(head, payload)? {
                        return Ok(Some(frame));
                    }
                }
                Kind::Continuation => {
                    if let Some(frame) = self.continuation_frame(head, payload)? {
                        return Ok(Some(frame));
                    }
                }
                Kind::Priority => {
                    // A stream cannot depend on itself, but beyond that
                    // priority signals are advisory and ignored here.
                    if head.stream_id == 0 {
                        return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
                    }
                }
                Kind::Reset => {
                    let reason = frame::load_reset(head, &payload)?;
                    return Ok(Some(Frame::Reset {
                        stream_id: head.stream_id,
                        reason,
                    }));
                }
                Kind::Settings => {
                    if head.is_ack() {
                        frame::Settings::load(head, &payload)?;
                        return Ok(Some(Frame::SettingsAck));
                    }
                    let settings = frame::Settings::load(head, &payload)?;
                    return Ok(Some(Frame::Settings(settings)));
                }
                Kind::PushPromise => {
                    // Push is disabled in our SETTINGS; a promise is a
                    // protocol violation.
                    return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
                }
                Kind::Ping => {
                    let (bytes, ack) = frame::load_ping(head, &payload)?;
                    return Ok(Some(Frame::Ping {
                        ack,
                        payload: bytes,
                    }));
                }
                Kind::GoAway => {
                    let (last_stream_id, reason) = frame::load_go_away(&payload)?;
                    return Ok(Some(Frame::GoAway {
                        last_stream_id,
                        reason,
                    }));
                }
                Kind::WindowUpdate => {
                    let increment = frame::load_window_update(head, &payload)?;
                    return Ok(Some(Frame::WindowUpdate {
                        stream_id: head.stream_id,
                        increment,
                    }));
                }
                Kind::Unknown(_) => {
                    // Unknown frame types are ignored.
                }
            }
        }
    }

    /// Accumulates one head + payload from the transport.
    async fn fill_frame(&mut self) -> Result<Option<(Head, Bytes)>, RecvError> {
        while self.buf.len() < HEADER_LEN {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(RecvError::Io(io::ErrorKind::UnexpectedEof.into()))
                };
            }
        }
        let head = Head::parse(&self.buf[..HEADER_LEN]);
        if head.length > self.max_frame_size {
            return Err(RecvError::Connection(Reason::FRAME_SIZE_ERROR));
        }
        let frame_len = HEADER_LEN + head.length as usize;
        while self.buf.len() < frame_len {
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return Err(RecvError::Io(io::ErrorKind::UnexpectedEof.into()));
            }
        }
        let _ = self.buf.split_to(HEADER_LEN);
        let payload = self.buf.split_to(head.length as usize).freeze();
        Ok(Some((head, payload)))
    }

    fn data_frame(&mut self, head: Head, mut payload: Bytes) -> Result<Frame, RecvError> {
        if head.stream_id == 0 {
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }
        // Padding is stripped from the data but still occupies window.
        let flow_len = payload.len() as u32;
        if head.flag & frame::PADDED == frame::PADDED {
            frame::strip_padding(&mut payload)?;
        }
        Ok(Frame::Data {
            stream_id: head.stream_id,
            data: payload,
            flow_len,
            end_stream: head.is_end_stream(),
        })
    }

    fn headers_frame(&mut self, head: Head, mut payload: Bytes) -> Result<Option<Frame>, RecvError> {
        if head.stream_id == 0 {
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }
        if head.flag & frame::PADDED == frame::PADDED {
            frame::strip_padding(&mut payload)?;
        }
        if head.flag & frame::PRIORITY == frame::PRIORITY {
            if payload.len() < 5 {
                return Err(RecvError::Connection(Reason::FRAME_SIZE_ERROR));
            }
            let _ = payload.split_to(5);
        }

        if head.is_end_headers() {
            let frame = self.decode_header_block(head.stream_id, head.is_end_stream(), &payload)?;
            return Ok(Some(frame));
        }

        let mut fragment = BytesMut::with_capacity(payload.len() * 2);
        fragment.extend_from_slice(&payload);
        self.partial = Some(Partial {
            stream_id: head.stream_id,
            end_stream: head.is_end_stream(),
            fragment,
        });
        Ok(None)
    }

    fn continuation_frame(
        &mut self,
        head: Head,
        payload: Bytes,
    ) -> Result<Option<Frame>, RecvError> {
        let mut partial = match self.partial.take() {
            Some(partial) => partial,
            None => {
                debug!("unexpected CONTINUATION frame");
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }
        };
        if partial.stream_id != head.stream_id {
            return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
        }
        partial.fragment.extend_from_slice(&payload);

        if !head.is_end_headers() {
            self.partial = Some(partial);
            return Ok(None);
        }

        let frame =
            self.decode_header_block(partial.stream_id, partial.end_stream, &partial.fragment)?;
        Ok(Some(frame))
    }

    fn decode_header_block(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        block: &[u8],
    ) -> Result<Frame, RecvError> {
        let raw = self.hpack.decode(block).map_err(|err| {
            debug!("hpack decoding failed: {:?}", err);
            RecvError::Connection(Reason::COMPRESSION_ERROR)
        })?;

        let mut pseudo = Pseudo::default();
        let mut fields = HeaderMap::with_capacity(raw.len());
        let mut seen_regular = false;

        for (name, value) in raw {
            if name.is_empty() {
                return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
            }
            if name[0] == b':' {
                // Pseudo-headers come strictly before regular fields.
                if seen_regular {
                    debug!("pseudo-header after regular header");
                    return Err(RecvError::Connection(Reason::PROTOCOL_ERROR));
                }
                match &name[..] {
                    b":status" => {
                        let status = std::str::from_utf8(&value)
                            .ok()
                            .and_then(|v| v.parse::<u16>().ok())
                            .and_then(|v| StatusCode::from_u16(v).ok())
                            .ok_or_else(|| RecvError::Stream {
                                id: stream_id,
                                reason: Reason::PROTOCOL_ERROR,
                            })?;
                        pseudo.status = Some(status);
                    }
                    // Request pseudo-headers in a response are malformed.
                    _ => {
                        return Err(RecvError::Stream {
                            id: stream_id,
                            reason: Reason::PROTOCOL_ERROR,
                        })
                    }
                }
                continue;
            }

            seen_regular = true;
            if name.iter().any(|b| b.is_ascii_uppercase()) {
                // Field names are lowercased on the wire.
                return Err(RecvError::Stream {
                    id: stream_id,
                    reason: Reason::PROTOCOL_ERROR,
                });
            }
            let name = HeaderName::from_bytes(&name).map_err(|_| RecvError::Stream {
                id: stream_id,
                reason: Reason::PROTOCOL_ERROR,
            })?;
            let value = HeaderValue::from_bytes(&value).map_err(|_| RecvError::Stream {
                id: stream_id,
                reason: Reason::PROTOCOL_ERROR,
            })?;
            fields.append(name, value);
        }

        Ok(Frame::Headers {
            stream_id,
            pseudo,
            fields,
            end_stream,
        })
    }
}

pub(crate) struct FramedWrite<T> {
    io: T,
    buf: BytesMut,
    hpack: hpack::Encoder,
    max_frame_size: u32,
}

impl<T> FramedWrite<T>
where
    T: AsyncWrite + Unpin,
{
    pub(crate) fn new(io: T) -> FramedWrite<T> {
        FramedWrite {
            io,
            buf: BytesMut::with_capacity(1024),
            hpack: hpack::Encoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub(crate) fn set_max_frame_size(&mut self, val: u32) {
        self.max_frame_size = val;
    }

    pub(crate) fn hpack_mut(&mut self) -> &mut hpack::Encoder {
        &mut self.hpack
    }

    /// Writes the connection preface followed by our SETTINGS.
    pub(crate) async fn send_preface(&mut self, settings: &Settings) -> io::Result<()> {
        self.buf.extend_from_slice(PREFACE);
        settings.encode(&mut self.buf);
        self.flush().await
    }

    pub(crate) async fn send_settings_ack(&mut self) -> io::Result<()> {
        Settings::encode_ack(&mut self.buf);
        self.flush().await
    }

    /// Writes one header block, splitting into HEADERS + CONTINUATION
    /// frames when it exceeds the peer's max frame size.
    pub(crate) async fn send_headers<'a, I>(
        &mut self,
        stream_id: u32,
        fields: I,
        end_stream: bool,
    ) -> io::Result<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8], bool)>,
    {
        let mut block = BytesMut::new();
        self.hpack.encode(fields, &mut block);

        let max = self.max_frame_size as usize;
        let mut flags = if end_stream { frame::END_STREAM } else { 0 };
        let mut kind = Kind::Headers;
        let mut rest = block.freeze();

        loop {
            let fragment = rest.split_to(std::cmp::min(max, rest.len()));
            if rest.is_empty() {
                flags |= frame::END_HEADERS;
            }
            Head::encode(kind, flags, stream_id, fragment.len(), &mut self.buf);
            self.buf.extend_from_slice(&fragment);
            if rest.is_empty() {
                break;
            }
            kind = Kind::Continuation;
            flags = 0;
        }
        self.flush().await
    }

    /// Writes one DATA frame. The caller has already clamped `data` to
    /// the flow-control windows and the peer's max frame size.
    pub(crate) async fn send_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    ) -> io::Result<()> {
        debug_assert!(data.len() <= self.max_frame_size as usize);
        let flags = if end_stream { frame::END_STREAM } else { 0 };
        Head::encode(Kind::Data, flags, stream_id, data.len(), &mut self.buf);
        self.buf.extend_from_slice(&data);
        self.flush().await
    }

    pub(crate) async fn send_ping(&mut self, payload: [u8; 8], ack: bool) -> io::Result<()> {
        frame::encode_ping(payload, ack, &mut self.buf);
        self.flush().await
    }

    pub(crate) async fn send_reset(&mut self, stream_id: u32, reason: Reason) -> io::Result<()> {
        frame::encode_reset(stream_id, reason, &mut self.buf);
        self.flush().await
    }

    pub(crate) async fn send_go_away(
        &mut self,
        last_stream_id: u32,
        reason: Reason,
    ) -> io::Result<()> {
        frame::encode_go_away(last_stream_id, reason, &mut self.buf);
        self.flush().await
    }

    pub(crate) async fn send_window_update(
        &mut self,
        stream_id: u32,
        increment: u32,
    ) -> io::Result<()> {
        frame::encode_window_update(stream_id, increment, &mut self.buf);
        self.flush().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        let buf = self.buf.split().freeze();
        self.io.write_all(&buf).await?;
        self.io.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_block_round_trip_through_codec() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_read_half, write_half) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut writer = FramedWrite::new(write_half);
        let mut reader = FramedRead::new(server_read, hpack::DEFAULT_HEADER_TABLE_SIZE);

        writer
            .send_headers(
                1,
                vec![
                    (&b":status"[..], &b"200"[..], false),
                    (&b"content-type"[..], &b"text/plain"[..], false),
                ],
                false,
            )
            .await
            .unwrap();

        match reader.read_frame().await.unwrap().unwrap() {
            Frame::Headers {
                stream_id,
                pseudo,
                fields,
                end_stream,
            } => {
                assert_eq!(stream_id, 1);
                assert_eq!(pseudo.status, Some(StatusCode::OK));
                assert_eq!(fields.get("content-type").unwrap(), "text/plain");
                assert!(!end_stream);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_frame_is_a_frame_size_error() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_r, mut write_half) = tokio::io::split(client);
        let (server_read, _w) = tokio::io::split(server);

        // Hand-roll a head that claims a payload beyond the default max.
        let mut head = BytesMut::new();
        Head::encode(Kind::Data, 0, 1, (DEFAULT_MAX_FRAME_SIZE + 1) as usize, &mut head);
        write_half.write_all(&head).await.unwrap();

        let mut reader = FramedRead::new(server_read, hpack::DEFAULT_HEADER_TABLE_SIZE);
        match reader.read_frame().await {
            Err(RecvError::Connection(reason)) => {
                assert_eq!(reason, Reason::FRAME_SIZE_ERROR)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn pseudo_after_regular_is_a_connection_error() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_r, write_half) = tokio::io::split(client);
        let (server_read, _w) = tokio::io::split(server);

        let mut writer = FramedWrite::new(write_half);
        writer
            .send_headers(
                1,
                vec![
                    (&b"content-type"[..], &b"text/plain"[..], false),
                    (&b":status"[..], &b"200"[..], false),
                ],
                true,
            )
            .await
            .unwrap();

        let mut reader = FramedRead::new(server_read, hpack::DEFAULT_HEADER_TABLE_SIZE);
        match reader.read_frame().await {
            Err(RecvError::Connection(reason)) => assert_eq!(reason, Reason::PROTOCOL_ERROR),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
