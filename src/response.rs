//! Client responses.

use std::fmt;
use std::time::SystemTime;

use http::header::HeaderMap;
use http::{Extensions, Method, StatusCode, Uri, Version};

use crate::body::ResponseBody;
use crate::tls::Handshake;

/// A response to a [`Request`](crate::Request).
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: ResponseBody,
    uri: Uri,
    method: Method,
    handshake: Option<Handshake>,
    sent_at: SystemTime,
    received_at: SystemTime,
    /// The response that triggered the follow-up producing this one.
    /// Its body is always drained or discarded.
    prior: Option<Box<Response>>,
    extensions: Extensions,
}

impl Response {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: ResponseBody,
        uri: Uri,
        method: Method,
        handshake: Option<Handshake>,
        sent_at: SystemTime,
        received_at: SystemTime,
    ) -> Response {
        Response {
            status,
            version,
            headers,
            body,
            uri,
            method,
            handshake,
            sent_at,
            received_at,
            prior: None,
            extensions: Extensions::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The URI this response was served for (after any redirects).
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The TLS handshake behind this response, if the route was encrypted.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// When the request headers left, wall-clock.
    pub fn sent_at(&self) -> SystemTime {
        self.sent_at
    }

    /// When the response headers arrived, wall-clock.
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// The response that caused this request to be re-issued (redirect,
    /// auth challenge, retry), if any.
    pub fn prior(&self) -> Option<&Response> {
        self.prior.as_deref()
    }

    pub(crate) fn set_prior(&mut self, prior: Response) {
        self.prior = Some(Box::new(prior));
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub(crate) fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    pub(crate) fn replace_body(&mut self, body: ResponseBody) -> ResponseBody {
        std::mem::replace(&mut self.body, body)
    }

    /// Reads the whole body. Convenience for `into_body().bytes()`.
    pub async fn bytes(self) -> crate::Result<bytes::Bytes> {
        self.body.bytes().await
    }

    /// Reads the whole body as text.
    pub async fn text(self) -> crate::Result<String> {
        self.body.text().await
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .finish()
    }
}
