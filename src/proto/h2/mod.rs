//! The HTTP/2 client engine: framing, HPACK, streams, flow control.

pub(crate) mod codec;
pub(crate) mod conn;
pub(crate) mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;

pub(crate) use self::conn::{H2Stream, Http2Connection, StreamBody};
pub(crate) use self::flow::{ReleaseOnConsume, ReleaseOnReceive, WindowCounter, WindowStrategy};

use std::fmt;

/// The client connection preface, sent before any frame.
pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame payloads may not exceed this until SETTINGS raises it.
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// The protocol's default flow-control window.
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// What this client advertises: 16 MiB for the connection and each stream.
pub(crate) const CLIENT_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Window increments may not push a window past this.
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// HTTP/2 error codes, as used in RST_STREAM and GOAWAY.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Reason(pub(crate) u32);

impl Reason {
    pub(crate) const NO_ERROR: Reason = Reason(0x0);
    pub(crate) const PROTOCOL_ERROR: Reason = Reason(0x1);
    pub(crate) const INTERNAL_ERROR: Reason = Reason(0x2);
    pub(crate) const FLOW_CONTROL_ERROR: Reason = Reason(0x3);
    #[allow(unused)]
    pub(crate) const SETTINGS_TIMEOUT: Reason = Reason(0x4);
    pub(crate) const STREAM_CLOSED: Reason = Reason(0x5);
    pub(crate) const FRAME_SIZE_ERROR: Reason = Reason(0x6);
    pub(crate) const REFUSED_STREAM: Reason = Reason(0x7);
    pub(crate) const CANCEL: Reason = Reason(0x8);
    pub(crate) const COMPRESSION_ERROR: Reason = Reason(0x9);
    #[allow(unused)]
    pub(crate) const CONNECT_ERROR: Reason = Reason(0xa);
    #[allow(unused)]
    pub(crate) const ENHANCE_YOUR_CALM: Reason = Reason(0xb);
    #[allow(unused)]
    pub(crate) const INADEQUATE_SECURITY: Reason = Reason(0xc);
    #[allow(unused)]
    pub(crate) const HTTP_1_1_REQUIRED: Reason = Reason(0xd);

    fn description(&self) -> &str {
        match self.0 {
            0x0 => "no error",
            0x1 => "protocol error",
            0x2 => "internal error",
            0x3 => "flow control error",
            0x4 => "settings timeout",
            0x5 => "stream closed",
            0x6 => "frame size error",
            0x7 => "refused stream",
            0x8 => "cancel",
            0x9 => "compression error",
            0xa => "connect error",
            0xb => "enhance your calm",
            0xc => "inadequate security",
            0xd => "http/1.1 required",
            _ => "unknown error code",
        }
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reason({})", self.description())
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// An HTTP/2 level failure: either the whole connection or one stream.
#[derive(Debug)]
pub(crate) struct H2Error {
    reason: Reason,
    scope: ErrorScope,
}

#[derive(Debug)]
enum ErrorScope {
    Connection,
    Stream(u32),
}

impl H2Error {
    pub(crate) fn connection(reason: Reason) -> H2Error {
        H2Error {
            reason,
            scope: ErrorScope::Connection,
        }
    }

    pub(crate) fn stream(id: u32, reason: Reason) -> H2Error {
        H2Error {
            reason,
            scope: ErrorScope::Stream(id),
        }
    }

    pub(crate) fn reason(&self) -> Reason {
        self.reason
    }

    pub(crate) fn stream_id(&self) -> Option<u32> {
        match self.scope {
            ErrorScope::Stream(id) => Some(id),
            ErrorScope::Connection => None,
        }
    }

    /// Streams refused by GOAWAY or RST(REFUSED_STREAM) were never
    /// processed; the request is safe to retry on another connection.
    pub(crate) fn is_retryable(&self) -> bool {
        self.reason == Reason::REFUSED_STREAM
    }
}

impl fmt::Display for H2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            ErrorScope::Connection => write!(f, "connection error: {}", self.reason),
            ErrorScope::Stream(id) => write!(f, "stream {} error: {}", id, self.reason),
        }
    }
}

impl std::error::Error for H2Error {}
