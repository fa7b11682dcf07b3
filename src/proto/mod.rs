//! Pieces pertaining to the HTTP message protocols.

use http::{HeaderMap, Method, StatusCode, Version};

/// The minimum value that can be set to max buffer size.
pub(crate) const MINIMUM_MAX_BUFFER_SIZE: usize = 8192;

/// The default maximum read buffer size. If the buffer gets this big and
/// a message head is still not complete, a `TooLarge` error is triggered.
pub(crate) const DEFAULT_MAX_BUFFER_SIZE: usize = MINIMUM_MAX_BUFFER_SIZE + 4096 * 100;

pub(crate) mod h1;
pub(crate) mod h2;

/// An outgoing request head: request line pieces plus headers.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    /// The request-target as it should appear on the wire: origin-form for
    /// direct requests, absolute-form through a cleartext HTTP proxy,
    /// authority-form for CONNECT.
    pub(crate) target: String,
    pub(crate) headers: HeaderMap,
}

/// An incoming response head.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
}

/// How a message body's extent is determined on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyLength {
    /// No body at all (1xx/204/304, HEAD, successful CONNECT).
    None,
    /// `Content-Length` bytes.
    Known(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Read until the peer closes; the connection is then unusable.
    CloseDelimited,
}

impl BodyLength {
    pub(crate) fn content_length(&self) -> Option<u64> {
        match *self {
            BodyLength::None => Some(0),
            BodyLength::Known(n) => Some(n),
            BodyLength::Chunked | BodyLength::CloseDelimited => None,
        }
    }
}
