//! Frame types and their wire format.
//!
//! A frame is a 9-byte head (24-bit length, 8-bit type, 8-bit flags,
//! reserved bit plus 31-bit stream id) followed by a payload. Header-block
//! assembly across CONTINUATION frames happens in the codec; the types
//! here deal in complete payloads.

use bytes::{BufMut, Bytes, BytesMut};

use super::{H2Error, Reason, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE};

pub(crate) const HEADER_LEN: usize = 9;

// Frame flags.
pub(crate) const ACK: u8 = 0x1;
pub(crate) const END_STREAM: u8 = 0x1;
pub(crate) const END_HEADERS: u8 = 0x4;
pub(crate) const PADDED: u8 = 0x8;
pub(crate) const PRIORITY: u8 = 0x20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl Kind {
    fn from_type(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            other => Kind::Unknown(other),
        }
    }

    fn type_byte(&self) -> u8 {
        match *self {
            Kind::Data => 0,
            Kind::Headers => 1,
            Kind::Priority => 2,
            Kind::Reset => 3,
            Kind::Settings => 4,
            Kind::PushPromise => 5,
            Kind::Ping => 6,
            Kind::GoAway => 7,
            Kind::WindowUpdate => 8,
            Kind::Continuation => 9,
            Kind::Unknown(other) => other,
        }
    }
}

/// The fixed 9-byte frame header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Head {
    pub(crate) kind: Kind,
    pub(crate) flag: u8,
    pub(crate) stream_id: u32,
    pub(crate) length: u32,
}

impl Head {
    /// Parses the head from exactly [`HEADER_LEN`] bytes.
    pub(crate) fn parse(header: &[u8]) -> Head {
        debug_assert_eq!(header.len(), HEADER_LEN);
        let length =
            (u32::from(header[0]) << 16) | (u32::from(header[1]) << 8) | u32::from(header[2]);
        let kind = Kind::from_type(header[3]);
        let flag = header[4];
        // The high bit of the stream id is reserved and ignored on read.
        let stream_id = (u32::from(header[5]) << 24
            | u32::from(header[6]) << 16
            | u32::from(header[7]) << 8
            | u32::from(header[8]))
            & !(1 << 31);
        Head {
            kind,
            flag,
            stream_id,
            length,
        }
    }

    pub(crate) fn encode(kind: Kind, flag: u8, stream_id: u32, length: usize, dst: &mut BytesMut) {
        debug_assert!(length <= MAX_MAX_FRAME_SIZE as usize);
        dst.reserve(HEADER_LEN + length);
        dst.put_u8((length >> 16) as u8);
        dst.put_u8((length >> 8) as u8);
        dst.put_u8(length as u8);
        dst.put_u8(kind.type_byte());
        dst.put_u8(flag);
        dst.put_u32(stream_id & !(1 << 31));
    }

    pub(crate) fn is_end_stream(&self) -> bool {
        self.flag & END_STREAM == END_STREAM
    }

    pub(crate) fn is_end_headers(&self) -> bool {
        self.flag & END_HEADERS == END_HEADERS
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.flag & ACK == ACK
    }
}

/// A fully assembled inbound frame.
#[derive(Debug)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        /// Bytes the frame occupied in the flow-control window, which
        /// includes any padding stripped from `data`.
        flow_len: u32,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        pseudo: Pseudo,
        fields: http::HeaderMap,
        end_stream: bool,
    },
    Reset {
        stream_id: u32,
        reason: Reason,
    },
    Settings(Settings),
    SettingsAck,
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        reason: Reason,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
}

/// Response pseudo-headers. Requests are encode-only for a client, so
/// only `:status` is ever parsed.
#[derive(Debug, Default)]
pub(crate) struct Pseudo {
    pub(crate) status: Option<http::StatusCode>,
}

/// The SETTINGS parameters either peer may announce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) header_table_size: Option<u32>,
    pub(crate) enable_push: Option<bool>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) initial_window_size: Option<u32>,
    pub(crate) max_frame_size: Option<u32>,
    pub(crate) max_header_list_size: Option<u32>,
}

impl Settings {
    const HEADER_TABLE_SIZE: u16 = 1;
    const ENABLE_PUSH: u16 = 2;
    const MAX_CONCURRENT_STREAMS: u16 = 3;
    const INITIAL_WINDOW_SIZE: u16 = 4;
    const MAX_FRAME_SIZE: u16 = 5;
    const MAX_HEADER_LIST_SIZE: u16 = 6;

    pub(crate) fn load(head: Head, payload: &[u8]) -> Result<Settings, H2Error> {
        debug_assert_eq!(head.kind, Kind::Settings);
        if head.stream_id != 0 {
            return Err(H2Error::connection(Reason::PROTOCOL_ERROR));
        }
        if head.is_ack() {
            return if payload.is_empty() {
                Ok(Settings::default())
            } else {
                Err(H2Error::connection(Reason::FRAME_SIZE_ERROR))
            };
        }
        if payload.len() % 6 != 0 {
            return Err(H2Error::connection(Reason::FRAME_SIZE_ERROR));
        }

        let mut settings = Settings::default();
        for entry in payload.chunks(6) {
            let id = u16::from(entry[0]) << 8 | u16::from(entry[1]);
            let value = u32::from(entry[2]) << 24
                | u32::from(entry[3]) << 16
                | u32::from(entry[4]) << 8
                | u32::from(entry[5]);
            match id {
                Settings::HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                Settings::ENABLE_PUSH => match value {
                    0 => settings.enable_push = Some(false),
                    1 => settings.enable_push = Some(true),
                    _ => return Err(H2Error::connection(Reason::PROTOCOL_ERROR)),
                },
                Settings::MAX_CONCURRENT_STREAMS => {
                    settings.max_concurrent_streams = Some(value)
                }
                Settings::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::connection(Reason::FLOW_CONTROL_ERROR));
                    }
                    settings.initial_window_size = Some(value);
                }
                Settings::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(H2Error::connection(Reason::PROTOCOL_ERROR));
                    }
                    settings.max_frame_size = Some(value);
                }
                Settings::MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // Unknown settings must be ignored.
                _ => {}
            }
        }
        Ok(settings)
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let mut push = |id: u16, value: u32| {
            payload.put_u16(id);
            payload.put_u32(value);
        };
        if let Some(v) = self.header_table_size {
            push(Settings::HEADER_TABLE_SIZE, v);
        }
        if let Some(v) = self.enable_push {
            push(Settings::ENABLE_PUSH, v as u32);
        }
        if let Some(v) = self.max_concurrent_streams {
            push(Settings::MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            push(Settings::INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.max_frame_size {
            push(Settings::MAX_FRAME_SIZE, v);
        }
        if let Some(v) = self.max_header_list_size {
            push(Settings::MAX_HEADER_LIST_SIZE, v);
        }
        Head::encode(Kind::Settings, 0, 0, payload.len(), dst);
        dst.extend_from_slice(&payload);
    }

    pub(crate) fn encode_ack(dst: &mut BytesMut) {
        Head::encode(Kind::Settings, ACK, 0, 0, dst);
    }
}

pub(crate) fn load_ping(head: Head, payload: &[u8]) -> Result<([u8; 8], bool), H2Error> {
    debug_assert_eq!(head.kind, Kind::Ping);
    if head.stream_id != 0 {
        return Err(H2Error::connection(Reason::PROTOCOL_ERROR));
    }
    if payload.len() != 8 {
        return Err(H2Error::connection(Reason::FRAME_SIZE_ERROR));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(payload);
    Ok((bytes, head.is_ack()))
}

pub(crate) fn encode_ping(payload: [u8; 8], ack: bool, dst: &mut BytesMut) {
    Head::encode(Kind::Ping, if ack { ACK } else { 0 }, 0, 8, dst);
    dst.extend_from_slice(&payload);
}

pub(crate) fn load_reset(head: Head, payload: &[u8]) -> Result<Reason, H2Error> {
    debug_assert_eq!(head.kind, Kind::Reset);
    if head.stream_id == 0 {
        return Err(H2Error::connection(Reason::PROTOCOL_ERROR));
    }
    if payload.len() != 4 {
        return Err(H2Error::connection(Reason::FRAME_SIZE_ERROR));
    }
    Ok(Reason(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ])))
}

pub(crate) fn encode_reset(stream_id: u32, reason: Reason, dst: &mut BytesMut) {
    Head::encode(Kind::Reset, 0, stream_id, 4, dst);
    dst.put_u32(reason.0);
}

pub(crate) fn load_go_away(payload: &[u8]) -> Result<(u32, Reason), H2Error> {
    if payload.len() < 8 {
        return Err(H2Error::connection(Reason::FRAME_SIZE_ERROR));
    }
    let last_stream_id =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & !(1 << 31);
    let reason = Reason(u32::from_be_bytes([
        payload[4], payload[5], payload[6], payload[7],
    ]));
    Ok((last_stream_id, reason))
}

pub(crate) fn encode_go_away(last_stream_id: u32, reason: Reason, dst: &mut BytesMut) {
    Head::encode(Kind::GoAway, 0, 0, 8, dst);
    dst.put_u32(last_stream_id & !(1 << 31));
    dst.put_u32(reason.0);
}

pub(crate) fn load_window_update(head: Head, payload: &[u8]) -> Result<u32, H2Error> {
    debug_assert_eq!(head.kind, Kind::WindowUpdate);
    if payload.len() != 4 {
        return Err(H2Error::connection(Reason::FRAME_SIZE_ERROR));
    }
    let increment =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & !(1 << 31);
    if increment == 0 {
        // A zero increment is a protocol error, stream- or
        // connection-level depending on the target.
        return Err(if head.stream_id == 0 {
            H2Error::connection(Reason::PROTOCOL_ERROR)
        } else {
            H2Error::stream(head.stream_id, Reason::PROTOCOL_ERROR)
        });
    }
    Ok(increment)
}

pub(crate) fn encode_window_update(stream_id: u32, increment: u32, dst: &mut BytesMut) {
    debug_assert!(increment > 0 && increment <= MAX_WINDOW_SIZE);
    Head::encode(Kind::WindowUpdate, 0, stream_id, 4, dst);
    dst.put_u32(increment);
}

/// Strips the padding from a padded DATA or HEADERS payload.
pub(crate) fn strip_padding(payload: &mut Bytes) -> Result<(), H2Error> {
    if payload.is_empty() {
        return Err(H2Error::connection(Reason::FRAME_SIZE_ERROR));
    }
    let pad_len = payload[0] as usize;
    if pad_len + 1 > payload.len() {
        return Err(H2Error::connection(Reason::PROTOCOL_ERROR));
    }
    let _ = payload.split_to(1);
    payload.truncate(payload.len() - pad_len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_round_trip() {
        let mut dst = BytesMut::new();
        Head::encode(Kind::Headers, END_HEADERS | END_STREAM, 5, 123, &mut dst);
        let head = Head::parse(&dst[..HEADER_LEN]);
        assert_eq!(head.kind, Kind::Headers);
        assert_eq!(head.length, 123);
        assert_eq!(head.stream_id, 5);
        assert!(head.is_end_stream());
        assert!(head.is_end_headers());
    }

    #[test]
    fn settings_round_trip() {
        let settings = Settings {
            initial_window_size: Some(1024),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            max_concurrent_streams: Some(7),
            ..Settings::default()
        };
        let mut dst = BytesMut::new();
        settings.encode(&mut dst);
        let head = Head::parse(&dst[..HEADER_LEN]);
        assert_eq!(head.kind, Kind::Settings);
        let parsed = Settings::load(head, &dst[HEADER_LEN..]).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn settings_rejects_oversized_window() {
        let mut dst = BytesMut::new();
        let settings = Settings::default();
        settings.encode(&mut dst);
        // Hand-roll an INITIAL_WINDOW_SIZE beyond 2^31-1.
        let mut raw = BytesMut::new();
        Head::encode(Kind::Settings, 0, 0, 6, &mut raw);
        raw.put_u16(4);
        raw.put_u32(1 << 31);
        let head = Head::parse(&raw[..HEADER_LEN]);
        let err = Settings::load(head, &raw[HEADER_LEN..]).unwrap_err();
        assert_eq!(err.reason(), Reason::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn zero_window_increment_is_an_error() {
        let mut raw = BytesMut::new();
        Head::encode(Kind::WindowUpdate, 0, 3, 4, &mut raw);
        raw.put_u32(0);
        let head = Head::parse(&raw[..HEADER_LEN]);
        assert!(load_window_update(head, &raw[HEADER_LEN..]).is_err());
    }

    #[test]
    fn goaway_round_trip() {
        let mut dst = BytesMut::new();
        encode_go_away(7, Reason::ENHANCE_YOUR_CALM, &mut dst);
        let (last, reason) = load_go_away(&dst[HEADER_LEN..]).unwrap();
        assert_eq!(last, 7);
        assert_eq!(reason, Reason::ENHANCE_YOUR_CALM);
    }
}
