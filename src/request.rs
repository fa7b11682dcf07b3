//! Client requests.

use std::fmt;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Extensions, Method, Uri};

use crate::body::Body;
use crate::error::{Error, Result};

/// A request ready to be sent with a [`Client`](crate::Client).
///
/// Headers are an ordered multimap: duplicates are allowed and preserved,
/// names compare case-insensitively.
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    extensions: Extensions,
}

impl Request {
    /// Starts building a request.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// A GET request for `uri`.
    pub fn get(uri: impl AsRef<str>) -> Builder {
        Builder::new().method(Method::GET).uri(uri)
    }

    /// A POST request for `uri`.
    pub fn post(uri: impl AsRef<str>) -> Builder {
        Builder::new().method(Method::POST).uri(uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// The typed tag map. Tags ride along with the request through the
    /// interceptor chain.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// A copy of this request, if the body is replayable.
    pub fn try_clone(&self) -> Option<Request> {
        let body = self.body.try_replay()?;
        Some(Request {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
            body,
            extensions: Extensions::new(),
        })
    }

    /// Rebuilds this request with a different target and body, keeping
    /// method and headers. Used when deriving follow-up requests.
    pub(crate) fn into_parts(self) -> (Method, Uri, HeaderMap, Body, Extensions) {
        (
            self.method,
            self.uri,
            self.headers,
            self.body,
            self.extensions,
        )
    }

    pub(crate) fn from_parts(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Body,
        extensions: Extensions,
    ) -> Request {
        Request {
            method,
            uri,
            headers,
            body,
            extensions,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Builds a [`Request`].
#[derive(Debug)]
pub struct Builder {
    method: Method,
    uri: Result<Uri>,
    headers: HeaderMap,
    body: Body,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            method: Method::GET,
            uri: Err(Error::new_user_absolute_uri_required()),
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    pub fn method(mut self, method: Method) -> Builder {
        self.method = method;
        self
    }

    pub fn uri(mut self, uri: impl AsRef<str>) -> Builder {
        self.uri = uri
            .as_ref()
            .parse::<Uri>()
            .map_err(|e| Error::new(crate::error::Kind::Parse(crate::error::Parse::Uri)).with(e));
        self
    }

    /// Appends a header, keeping any existing values for the same name.
    pub fn header(mut self, name: &str, value: &str) -> Builder {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Builder {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Request> {
        let uri = self.uri?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(Error::new_user_absolute_uri_required());
        }
        Ok(Request {
            method: self.method,
            uri,
            headers: self.headers,
            body: self.body,
            extensions: Extensions::new(),
        })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_absolute_uri() {
        assert!(Request::get("/relative").build().is_err());
        assert!(Request::get("http://example.test/ok").build().is_ok());
    }

    #[test]
    fn duplicate_headers_are_kept_in_order() {
        let req = Request::get("http://example.test/")
            .header("x-dup", "one")
            .header("x-dup", "two")
            .build()
            .unwrap();
        let values: Vec<_> = req.headers().get_all("x-dup").iter().collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[test]
    fn try_clone_refuses_one_shot() {
        let (_tx, body) = Body::channel(None);
        let req = Request::post("http://example.test/")
            .body(body)
            .build()
            .unwrap();
        assert!(req.try_clone().is_none());
    }
}
