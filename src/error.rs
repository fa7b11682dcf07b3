//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have squall `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP calls.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    /// Failures that were recovered from (and retried past) before this
    /// error was finally surfaced. Lets a caller see what went wrong across
    /// the whole route plan.
    suppressed: Vec<Error>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    User(User),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// A pending item was dropped before ever being processed.
    Canceled,
    /// Indicates a channel (enqueue callback or body sender) is closed.
    ChannelClosed,
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    Io,
    /// Error occurred while connecting.
    Connect,
    /// Every route in the plan failed.
    RoutesExhausted,
    /// TLS-level failure: handshake, untrusted chain, hostname mismatch, pinning.
    Tls(Tls),
    /// Error while reading a body from connection.
    Body,
    /// Error while writing a body to connection.
    BodyWrite,
    /// An HTTP/2 connection or stream error.
    Http2,
    /// A WebSocket protocol violation.
    WebSocket,
    /// The follow-up chain exceeded the hard cap.
    TooManyFollowUps,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Version,
    Uri,
    Header,
    ContentLengthInvalid,
    TransferEncodingUnexpected,
    TooLarge,
    Status,
}

#[derive(Debug)]
pub(crate) enum Tls {
    Handshake,
    UntrustedChain,
    HostnameMismatch,
    Pinning,
}

#[derive(Debug)]
pub(crate) enum User {
    /// Call was executed or enqueued a second time.
    AlreadyExecuted,
    /// User tried to send a request without an absolute URI.
    AbsoluteUriRequired,
    /// Request has a version or scheme the client cannot speak.
    UnsupportedScheme,
    /// WebSocket close() or send() after the writer was closed.
    WriteAfterClose,
    /// User polled for an upgrade that doesn't exist.
    NoUpgrade,
}

// Sentinel type to indicate the error was caused by a timeout.
#[derive(Debug)]
pub(crate) struct TimedOut;

impl Error {
    /// Returns true if this was an HTTP/1 parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this error is fatal to the call's protocol exchange:
    /// malformed HTTP/1, HTTP/2 connection errors, WebSocket violations, or
    /// an overlong follow-up chain. A truncated message is an I/O failure,
    /// not a protocol one.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Parse(_) | Kind::Http2 | Kind::WebSocket | Kind::TooManyFollowUps
        )
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this was about a `Call` that was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if a sender's channel is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if this was an error while connecting.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect | Kind::RoutesExhausted)
    }

    /// Returns true if this was an I/O error on an established connection.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if this was a TLS-level failure.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls(_))
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        self.find_source::<TimedOut>().is_some()
            || self
                .find_source::<std::io::Error>()
                .map(|io| io.kind() == std::io::ErrorKind::TimedOut)
                .unwrap_or(false)
    }

    /// The failures that were recovered from before this error surfaced.
    ///
    /// When the retry interceptor exhausts its route plan, each per-route
    /// failure is attached here in the order it occurred.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn with_suppressed(mut self, suppressed: Vec<Error>) -> Error {
        self.inner.suppressed = suppressed;
        self
    }

    pub(crate) fn push_suppressed(&mut self, err: Error) {
        self.inner.suppressed.push(err);
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }

        // else
        None
    }

    pub(crate) fn h2_reason(&self) -> crate::proto::h2::Reason {
        // Find an h2 Reason somewhere in the cause stack, if it exists,
        // otherwise assume an INTERNAL_ERROR.
        self.find_source::<crate::proto::h2::H2Error>()
            .map(|h2_err| h2_err.reason())
            .unwrap_or(crate::proto::h2::Reason::INTERNAL_ERROR)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Io).with(TimedOut)
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_connect_timeout() -> Error {
        Error::new(Kind::Connect).with(TimedOut)
    }

    pub(crate) fn new_routes_exhausted(suppressed: Vec<Error>) -> Error {
        Error::new(Kind::RoutesExhausted).with_suppressed(suppressed)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Body).with(cause)
    }

    pub(crate) fn new_body_write<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::BodyWrite).with(cause)
    }

    pub(crate) fn new_tls_handshake<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls(Tls::Handshake)).with(cause)
    }

    pub(crate) fn new_tls_untrusted() -> Error {
        Error::new(Kind::Tls(Tls::UntrustedChain))
    }

    pub(crate) fn new_tls_hostname(host: &str) -> Error {
        Error::new(Kind::Tls(Tls::HostnameMismatch)).with(format!(
            "peer certificate does not match hostname {:?}",
            host
        ))
    }

    pub(crate) fn new_tls_pinning() -> Error {
        Error::new(Kind::Tls(Tls::Pinning))
    }

    pub(crate) fn new_h2(cause: crate::proto::h2::H2Error) -> Error {
        Error::new(Kind::Http2).with(cause)
    }

    pub(crate) fn new_websocket<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::WebSocket).with(cause)
    }

    pub(crate) fn new_too_many_follow_ups(count: usize) -> Error {
        Error::new(Kind::TooManyFollowUps).with(format!("too many follow-up requests: {}", count))
    }

    fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(crate) fn new_user_already_executed() -> Error {
        Error::new_user(User::AlreadyExecuted)
    }

    pub(crate) fn new_user_absolute_uri_required() -> Error {
        Error::new_user(User::AbsoluteUriRequired)
    }

    pub(crate) fn new_user_unsupported_scheme() -> Error {
        Error::new_user(User::UnsupportedScheme)
    }

    pub(crate) fn new_user_write_after_close() -> Error {
        Error::new_user(User::WriteAfterClose)
    }

    pub(crate) fn new_user_no_upgrade() -> Error {
        Error::new_user(User::NoUpgrade)
    }

    /// The error's standalone message, without the message from the source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::ContentLengthInvalid) => "invalid content-length parsed",
            Kind::Parse(Parse::TransferEncodingUnexpected) => "unexpected transfer-encoding parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Canceled => "call was canceled",
            Kind::ChannelClosed => "channel closed",
            Kind::Io => "connection error",
            Kind::Connect => "error trying to connect",
            Kind::RoutesExhausted => "every route in the plan failed",
            Kind::Tls(Tls::Handshake) => "TLS handshake failed",
            Kind::Tls(Tls::UntrustedChain) => "peer certificate chain is not trusted",
            Kind::Tls(Tls::HostnameMismatch) => "peer certificate does not match hostname",
            Kind::Tls(Tls::Pinning) => "certificate pinning failure",
            Kind::Body => "error reading a body from connection",
            Kind::BodyWrite => "error writing a body to connection",
            Kind::Http2 => "http2 error",
            Kind::WebSocket => "websocket protocol error",
            Kind::TooManyFollowUps => "too many follow-up requests",
            Kind::User(User::AlreadyExecuted) => "call already executed",
            Kind::User(User::AbsoluteUriRequired) => "client requires absolute-form URIs",
            Kind::User(User::UnsupportedScheme) => "request URI has unsupported scheme",
            Kind::User(User::WriteAfterClose) => "write after close",
            Kind::User(User::NoUpgrade) => "no upgrade available",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("squall::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        if !self.inner.suppressed.is_empty() {
            f.field(&self.inner.suppressed);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<Parse> for Error {
    fn from(err: Parse) -> Error {
        Error::new(Kind::Parse(err))
    }
}

impl From<httparse::Error> for Parse {
    fn from(err: httparse::Error) -> Parse {
        match err {
            httparse::Error::HeaderName
            | httparse::Error::HeaderValue
            | httparse::Error::NewLine
            | httparse::Error::Token => Parse::Header,
            httparse::Error::Status => Parse::Status,
            httparse::Error::TooManyHeaders => Parse::TooLarge,
            httparse::Error::Version => Parse::Version,
        }
    }
}

impl From<http::status::InvalidStatusCode> for Parse {
    fn from(_: http::status::InvalidStatusCode) -> Parse {
        Parse::Status
    }
}

impl From<http::uri::InvalidUri> for Parse {
    fn from(_: http::uri::InvalidUri) -> Parse {
        Parse::Uri
    }
}

trait AssertSendSync: Send + Sync + 'static {}
impl AssertSendSync for Error {}

// ===== impl TimedOut ====

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn timeout_is_found_through_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(Error::new_io(io).is_timeout());
        assert!(Error::new_timeout().is_timeout());
        assert!(!Error::new_closed().is_timeout());
    }

    #[test]
    fn suppressed_failures_are_kept_in_order() {
        let mut err = Error::new_routes_exhausted(vec![Error::new_connect_timeout()]);
        err.push_suppressed(Error::new_incomplete());
        assert_eq!(err.suppressed().len(), 2);
        assert!(err.suppressed()[0].is_timeout());
        assert!(err.suppressed()[1].is_incomplete_message());
    }

    #[test]
    fn h2_reason_unknown() {
        let closed = Error::new_closed();
        assert_eq!(closed.h2_reason(), crate::proto::h2::Reason::INTERNAL_ERROR);
    }
}
