//! The client role: serialize request heads, parse response heads.

use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use tracing::trace;

use crate::error::Parse;
use crate::proto::{BodyLength, RequestHead, ResponseHead};

const MAX_HEADERS: usize = 100;
const AVERAGE_HEADER_SIZE: usize = 30; // totally scientific

/// Serializes a request head into `dst`.
///
/// The body framing headers (`Content-Length` / `Transfer-Encoding`) must
/// already be present; this writes exactly what it is given.
pub(crate) fn encode_request(head: &RequestHead, dst: &mut BytesMut) {
    trace!(
        "encode_request method={:?}, target={:?}",
        head.method,
        head.target
    );

    let init_cap = 30 + head.target.len() + head.headers.len() * AVERAGE_HEADER_SIZE;
    dst.reserve(init_cap);

    dst.extend_from_slice(head.method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(head.target.as_bytes());
    dst.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in head.headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"\r\n");
}

/// Sets the framing headers for an outgoing body of `len`.
pub(crate) fn set_length(headers: &mut HeaderMap, len: Option<u64>) -> BodyLength {
    match len {
        Some(0) => BodyLength::None,
        Some(n) => {
            let mut buf = itoa::Buffer::new();
            headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(buf.format(n)).expect("itoa is a valid header value"),
            );
            BodyLength::Known(n)
        }
        None => {
            headers.insert(
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            );
            BodyLength::Chunked
        }
    }
}

/// Attempts to parse a response head from `buf`.
///
/// `Ok(None)` means more bytes are needed. On success the parsed bytes are
/// consumed from `buf`.
pub(crate) fn parse_response(buf: &mut BytesMut) -> Result<Option<ResponseHead>, Parse> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    trace!("Response.parse([Header; {}], [u8; {}])", MAX_HEADERS, buf.len());
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf)? {
        httparse::Status::Complete(len) => {
            trace!("Response.parse Complete({})", len);
            len
        }
        httparse::Status::Partial => return Ok(None),
    };

    let version = if res.version.unwrap() == 1 {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };
    let status = StatusCode::from_u16(res.code.unwrap()).map_err(Parse::from)?;

    let mut header_map = HeaderMap::with_capacity(res.headers.len());
    for h in res.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| Parse::Header)?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| Parse::Header)?;
        header_map.append(name, value);
    }

    let _ = buf.split_to(len);

    Ok(Some(ResponseHead {
        version,
        status,
        headers: header_map,
    }))
}

/// Peeks at a buffered response head without consuming it.
///
/// Returns the status and the head's length in bytes once complete. Used
/// to watch for `100 Continue` and to skip interim responses.
pub(crate) fn parse_response_peek(buf: &[u8]) -> Result<Option<(StatusCode, usize)>, Parse> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf)? {
        httparse::Status::Complete(len) => {
            let status = StatusCode::from_u16(res.code.unwrap()).map_err(Parse::from)?;
            Ok(Some((status, len)))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Infers how long the response body is, per RFC 7230 §3.3.3.
///
/// The order matters: status first, then `Transfer-Encoding`, then
/// `Content-Length`, and finally read-to-close (which costs the connection
/// its reusability).
pub(crate) fn response_body_length(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<BodyLength, Parse> {
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyLength::None);
    }
    if method == Method::HEAD {
        return Ok(BodyLength::None);
    }
    if method == Method::CONNECT && status.is_success() {
        return Ok(BodyLength::None);
    }

    if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
        let te = te.to_str().map_err(|_| Parse::Header)?;
        // `chunked` must be the final encoding of a response that uses it.
        if te
            .split(',')
            .last()
            .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
        {
            return Ok(BodyLength::Chunked);
        }
        return Ok(BodyLength::CloseDelimited);
    }

    let mut lengths = headers.get_all(header::CONTENT_LENGTH).iter();
    if let Some(first) = lengths.next() {
        let value = first
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(Parse::ContentLengthInvalid)?;
        // Multiple differing Content-Length headers are malformed.
        for other in lengths {
            if other != first {
                return Err(Parse::ContentLengthInvalid);
            }
        }
        return Ok(BodyLength::Known(value));
    }

    Ok(BodyLength::CloseDelimited)
}

/// Whether the response head forbids reusing the connection.
pub(crate) fn connection_close(version: Version, headers: &HeaderMap) -> bool {
    match headers.get(header::CONNECTION) {
        Some(value) => {
            let value = value.to_str().unwrap_or("");
            if version == Version::HTTP_10 {
                !value.eq_ignore_ascii_case("keep-alive")
            } else {
                value
                    .split(',')
                    .any(|v| v.trim().eq_ignore_ascii_case("close"))
            }
        }
        None => version == Version::HTTP_10,
    }
}
