//! One request-response life on a borrowed connection.
//!
//! The exchange writes the request through the HTTP/1 codec or an HTTP/2
//! stream, reads the response head, and turns the remainder into a
//! response body that releases the connection when it completes. Call
//! cancellation races every await through the call's cancel handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, StatusCode, Uri};
use tracing::{debug, trace};

use super::{Borrowed, Connection, Pool, Stream};
use crate::body::{Body, ChunkSource, ResponseBody};
use crate::client::call::CancelHandle;
use crate::connect::Proxy;
use crate::error::{Error, Result};
use crate::proto::h1::{role, Decoder, Http1Codec};
use crate::proto::h2::{H2Stream, Reason, StreamBody};
use crate::proto::{BodyLength, RequestHead, ResponseHead};
use crate::request::Request;
use crate::upgrade::{self, OnUpgrade, Upgraded};

/// Stashed in response extensions so the retry layer can revoke
/// coalescing after a `421 Misdirected Request`.
pub(crate) struct ExchangeConn(pub(crate) Arc<Connection>);

/// How long to wait for `100 Continue` before sending the body anyway.
const EXPECT_CONTINUE_WINDOW: Duration = Duration::from_secs(1);

pub(crate) struct Exchange {
    pool: Pool,
    conn: Arc<Connection>,
    call_id: u64,
    cancel: CancelHandle,
    kind: Kind,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    sent_at: Option<SystemTime>,
    received_at: Option<SystemTime>,
    /// Set when an `Expect: 100-continue` request was denied the body;
    /// the connection cannot be reused afterwards.
    body_skipped: bool,
}

enum Kind {
    H1 { codec: Option<Http1Codec<Stream>> },
    H2 { stream: Option<H2Stream> },
}

impl Exchange {
    pub(crate) fn new(
        pool: Pool,
        conn: Arc<Connection>,
        borrowed: Borrowed,
        call_id: u64,
        cancel: CancelHandle,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Exchange {
        let kind = match borrowed {
            Borrowed::H1(codec) => Kind::H1 { codec: Some(codec) },
            // The stream is opened when the request is sent; the engine
            // handle is reachable through the connection.
            Borrowed::H2(_) => Kind::H2 { stream: None },
        };
        Exchange {
            pool,
            conn,
            call_id,
            cancel,
            kind,
            read_timeout,
            write_timeout,
            sent_at: None,
            received_at: None,
            body_skipped: false,
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub(crate) fn sent_at(&self) -> SystemTime {
        self.sent_at.unwrap_or_else(SystemTime::now)
    }

    pub(crate) fn received_at(&self) -> SystemTime {
        self.received_at.unwrap_or_else(SystemTime::now)
    }

    /// Writes the request head and streams the body.
    pub(crate) async fn send_request(&mut self, request: &mut Request) -> Result<()> {
        self.sent_at = Some(SystemTime::now());
        match &mut self.kind {
            Kind::H1 { .. } => self.send_request_h1(request).await,
            Kind::H2 { .. } => self.send_request_h2(request).await,
        }
    }

    async fn send_request_h1(&mut self, request: &mut Request) -> Result<()> {
        let target = request_target(request.method(), request.uri(), self.conn.route());
        let mut headers = request.headers().clone();

        let body_len = if may_have_body(request.method(), request.body()) {
            let len = role::set_length(&mut headers, request.body().content_length());
            if len == BodyLength::None && request_method_expects_body(request.method()) {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            len
        } else {
            BodyLength::None
        };

        let head = RequestHead {
            method: request.method().clone(),
            target,
            headers,
        };

        let codec = match &mut self.kind {
            Kind::H1 { codec } => codec.as_mut().expect("codec checked out"),
            Kind::H2 { .. } => unreachable!(),
        };

        let cancel = self.cancel.clone();
        let write_timeout = self.write_timeout;

        guarded(&cancel, write_timeout, codec.write_request_head(&head, body_len)).await?;

        let mut send_body = body_len != BodyLength::None;
        if send_body && has_expect_continue(request.headers()) {
            let go = guarded(
                &cancel,
                self.read_timeout,
                codec.await_continue(EXPECT_CONTINUE_WINDOW),
            )
            .await?;
            if !go {
                debug!("server declined 100-continue; skipping request body");
                self.body_skipped = true;
                send_body = false;
            }
        }

        if send_body {
            while let Some(chunk) = request.body_mut().data().await {
                let chunk = chunk?;
                guarded(&cancel, write_timeout, codec.write_body(chunk)).await?;
            }
        }
        if !self.body_skipped {
            guarded(&cancel, write_timeout, codec.finish_body()).await?;
        }
        Ok(())
    }

    async fn send_request_h2(&mut self, request: &mut Request) -> Result<()> {
        let engine = self
            .conn
            .h2()
            .expect("h2 exchange on multiplexed connection")
            .clone();

        let end_stream = request.body().is_empty();
        let fields = h2_request_fields(request)?;
        let mut stream = guarded(
            &self.cancel,
            self.write_timeout,
            engine.new_stream(fields, end_stream),
        )
        .await?;

        if !end_stream {
            loop {
                let chunk = match request.body_mut().data().await {
                    Some(chunk) => Some(chunk?),
                    None => None,
                };
                match chunk {
                    Some(chunk) => {
                        let send = stream.send_data(chunk, false);
                        match guarded(&self.cancel, self.write_timeout, send).await {
                            Ok(()) => {}
                            Err(err) => {
                                stream.reset(Reason::CANCEL);
                                return Err(err);
                            }
                        }
                    }
                    None => {
                        let send = stream.send_data(Bytes::new(), true);
                        if let Err(err) =
                            guarded(&self.cancel, self.write_timeout, send).await
                        {
                            stream.reset(Reason::CANCEL);
                            return Err(err);
                        }
                        break;
                    }
                }
            }
        }

        self.kind = Kind::H2 {
            stream: Some(stream),
        };
        Ok(())
    }

    /// Reads the final response head.
    pub(crate) async fn read_response_head(&mut self) -> Result<ResponseHead> {
        let cancel = self.cancel.clone();
        let read_timeout = self.read_timeout;
        let head = match &mut self.kind {
            Kind::H1 { codec } => {
                let codec = codec.as_mut().expect("codec checked out");
                guarded(&cancel, read_timeout, codec.read_response_head()).await
            }
            Kind::H2 { stream } => {
                let stream = stream.as_mut().ok_or_else(Error::new_closed)?;
                let result = guarded(&cancel, read_timeout, stream.read_response()).await;
                if result.is_err() {
                    stream.reset(Reason::CANCEL);
                }
                result
            }
        };
        if head.is_ok() {
            self.received_at = Some(SystemTime::now());
        }
        if let Err(err) = &head {
            self.abort_on_error(err);
        }
        head
    }

    /// Converts the remainder of the exchange into a response body (and
    /// an upgrade handle for `101`).
    pub(crate) fn into_body(
        mut self,
        method: &Method,
        head: &ResponseHead,
    ) -> Result<(ResponseBody, OnUpgrade)> {
        match std::mem::replace(&mut self.kind, Kind::H2 { stream: None }) {
            Kind::H1 { codec } => {
                let mut codec = codec.expect("codec checked out");
                if head.status == StatusCode::SWITCHING_PROTOCOLS {
                    // The connection leaves the HTTP world entirely.
                    self.conn.set_no_new_exchanges();
                    let (stream, leftover) = codec.into_parts();
                    self.pool.release(&self.conn, self.call_id);
                    self.consumed_by_body();
                    let (pending, on_upgrade) = upgrade::pending();
                    pending.fulfill(Upgraded::new(Box::new(stream), leftover));
                    return Ok((ResponseBody::empty(), on_upgrade));
                }

                let body_len = match role::response_body_length(method, head.status, &head.headers)
                {
                    Ok(len) => len,
                    Err(parse) => {
                        codec.close();
                        self.conn.park_codec(codec);
                        self.pool.release(&self.conn, self.call_id);
                        self.consumed_by_body();
                        return Err(Error::from(parse));
                    }
                };

                let reusable = !self.body_skipped
                    && !role::connection_close(head.version, &head.headers);

                if body_len == BodyLength::None || body_len == BodyLength::Known(0) {
                    codec.finish_response(reusable);
                    self.conn.park_codec(codec);
                    self.pool.release(&self.conn, self.call_id);
                    self.consumed_by_body();
                    return Ok((ResponseBody::empty(), OnUpgrade::none()));
                }

                let decoder = Decoder::new(body_len);
                // Close-delimited bodies consume the connection.
                let reusable = reusable && body_len != BodyLength::CloseDelimited;
                let source = H1BodySource {
                    pool: self.pool.clone(),
                    conn: self.conn.clone(),
                    call_id: self.call_id,
                    cancel: self.cancel.clone(),
                    read_timeout: self.read_timeout,
                    codec: Some(codec),
                    decoder,
                    reusable,
                    done: false,
                };
                self.consumed_by_body();
                Ok((
                    ResponseBody::streamed(body_len.content_length(), Box::new(source)),
                    OnUpgrade::none(),
                ))
            }
            Kind::H2 { stream } => {
                let stream = stream.ok_or_else(Error::new_closed)?;
                let source = H2BodySource {
                    pool: self.pool.clone(),
                    conn: self.conn.clone(),
                    call_id: self.call_id,
                    cancel: self.cancel.clone(),
                    read_timeout: self.read_timeout,
                    inner: stream.into_body(),
                    released: false,
                };
                self.consumed_by_body();
                Ok((
                    ResponseBody::streamed(content_length_of(&head.headers), Box::new(source)),
                    OnUpgrade::none(),
                ))
            }
        }
    }

    /// The body source now owns the release; disarm this exchange's drop.
    fn consumed_by_body(&mut self) {
        self.call_id = u64::MAX;
    }

    fn abort_on_error(&self, err: &Error) {
        if err.is_canceled() || err.is_io() || err.is_protocol() {
            // HTTP/1 cannot recover mid-message; HTTP/2 stream errors
            // were already RST and the engine handles connection errors.
            if !self.conn.is_multiplexed() {
                self.conn.set_no_new_exchanges();
            }
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.call_id == u64::MAX {
            return;
        }
        // The exchange died before producing a body: give the codec back
        // (poisoned or not) and the borrow up.
        match std::mem::replace(&mut self.kind, Kind::H2 { stream: None }) {
            Kind::H1 { codec: Some(codec) } => self.conn.park_codec(codec),
            Kind::H1 { codec: None } => {}
            Kind::H2 { stream: Some(stream) } => stream.reset(Reason::CANCEL),
            Kind::H2 { stream: None } => {}
        }
        self.pool.release(&self.conn, self.call_id);
    }
}

/// Streams an HTTP/1 response body, then returns the codec to the
/// connection and the connection to the pool.
struct H1BodySource {
    pool: Pool,
    conn: Arc<Connection>,
    call_id: u64,
    cancel: CancelHandle,
    read_timeout: Option<Duration>,
    codec: Option<Http1Codec<Stream>>,
    decoder: Decoder,
    reusable: bool,
    done: bool,
}

impl H1BodySource {
    fn finish(&mut self, reusable: bool) {
        if let Some(mut codec) = self.codec.take() {
            codec.finish_response(reusable);
            self.conn.park_codec(codec);
            self.pool.release(&self.conn, self.call_id);
        }
        self.done = true;
    }
}

impl ChunkSource for H1BodySource {
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>>> + Send + '_>> {
        Box::pin(async move {
            if self.done {
                return Ok(None);
            }
            let cancel = self.cancel.clone();
            let read_timeout = self.read_timeout;
            let codec = self.codec.as_mut().expect("codec present until done");
            let decoder = &mut self.decoder;
            match guarded(&cancel, read_timeout, codec.read_body(decoder)).await {
                Ok(chunk) if chunk.is_empty() => {
                    let reusable = self.reusable;
                    self.finish(reusable);
                    Ok(None)
                }
                Ok(chunk) => Ok(Some(chunk)),
                Err(err) => {
                    self.finish(false);
                    Err(err)
                }
            }
        })
    }
}

impl Drop for H1BodySource {
    fn drop(&mut self) {
        if !self.done {
            // Abandoned mid-body: the connection holds unread bytes and
            // cannot be reused.
            trace!("response body dropped before exhaustion; discarding connection");
            if let Some(mut codec) = self.codec.take() {
                codec.close();
                self.conn.park_codec(codec);
            }
            self.conn.set_no_new_exchanges();
            self.pool.release(&self.conn, self.call_id);
        }
    }
}

/// Streams an HTTP/2 response body; releasing the borrow when done. The
/// engine-level stream cleanup (window release, RST) lives in the inner
/// [`StreamBody`].
struct H2BodySource {
    pool: Pool,
    conn: Arc<Connection>,
    call_id: u64,
    cancel: CancelHandle,
    read_timeout: Option<Duration>,
    inner: StreamBody,
    released: bool,
}

impl ChunkSource for H2BodySource {
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bytes>>> + Send + '_>> {
        Box::pin(async move {
            if self.released {
                return Ok(None);
            }
            let cancel = self.cancel.clone();
            let read_timeout = self.read_timeout;
            let result = guarded(&cancel, read_timeout, self.inner.next_chunk()).await;
            match result {
                Ok(Some(chunk)) => Ok(Some(chunk)),
                Ok(None) => {
                    self.released = true;
                    self.pool.release(&self.conn, self.call_id);
                    Ok(None)
                }
                Err(err) => {
                    self.released = true;
                    self.pool.release(&self.conn, self.call_id);
                    Err(err)
                }
            }
        })
    }
}

impl Drop for H2BodySource {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(&self.conn, self.call_id);
        }
    }
}

/// Races an exchange operation against cancellation and a timeout.
async fn guarded<F, T>(
    cancel: &CancelHandle,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guarded = async {
        tokio::select! {
            result = fut => result,
            _ = cancel.canceled() => Err(Error::new_canceled()),
        }
    };
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
            Ok(result) => result,
            Err(_) => Err(Error::new_timeout()),
        },
        None => guarded.await,
    }
}

fn content_length_of(headers: &http::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn has_expect_continue(headers: &http::HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("100-continue"))
        .unwrap_or(false)
}

fn may_have_body(method: &Method, body: &Body) -> bool {
    !body.is_empty() || request_method_expects_body(method)
}

fn request_method_expects_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// The request-target for the request line: origin-form normally,
/// absolute-form through a cleartext HTTP proxy.
fn request_target(method: &Method, uri: &Uri, route: &crate::connect::Route) -> String {
    if method == Method::CONNECT {
        return format!(
            "{}:{}",
            route.address().host(),
            route.address().port()
        );
    }
    let origin_form = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let via_cleartext_proxy =
        matches!(route.proxy(), Proxy::Http { .. }) && !route.address().is_https();
    if via_cleartext_proxy {
        format!(
            "{}://{}{}",
            uri.scheme_str().unwrap_or("http"),
            uri.authority().map(|a| a.as_str()).unwrap_or_default(),
            origin_form
        )
    } else {
        origin_form
    }
}

/// Builds the HTTP/2 field list: pseudo-headers first, then regular
/// fields with connection-specific headers dropped and credentials
/// marked sensitive.
fn h2_request_fields(request: &Request) -> Result<Vec<(Bytes, Bytes, bool)>> {
    let uri = request.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_owned())
        .ok_or_else(Error::new_user_absolute_uri_required)?;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    let mut fields: Vec<(Bytes, Bytes, bool)> = Vec::with_capacity(request.headers().len() + 4);
    fields.push((
        Bytes::from_static(b":method"),
        Bytes::copy_from_slice(request.method().as_str().as_bytes()),
        false,
    ));
    fields.push((
        Bytes::from_static(b":scheme"),
        Bytes::copy_from_slice(scheme.as_bytes()),
        false,
    ));
    fields.push((
        Bytes::from_static(b":authority"),
        Bytes::from(authority.into_bytes()),
        false,
    ));
    fields.push((
        Bytes::from_static(b":path"),
        Bytes::from(path.into_bytes()),
        false,
    ));

    for (name, value) in request.headers() {
        if is_connection_specific(name) {
            continue;
        }
        let sensitive = *name == header::AUTHORIZATION
            || *name == header::COOKIE
            || *name == header::PROXY_AUTHORIZATION;
        fields.push((
            Bytes::copy_from_slice(name.as_str().as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            sensitive,
        ));
    }
    Ok(fields)
}

fn is_connection_specific(name: &header::HeaderName) -> bool {
    *name == header::CONNECTION
        || *name == header::TRANSFER_ENCODING
        || *name == header::UPGRADE
        || *name == header::TE
        || *name == header::HOST
        || name.as_str() == "keep-alive"
        || name.as_str() == "proxy-connection"
}
