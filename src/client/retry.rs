//! Recovering from failures and following up on responses.
//!
//! Sits just inside the application interceptors. On an I/O failure it
//! decides whether another route (or a fresh connection) deserves a try;
//! on a response it derives the follow-up request demanded by redirects,
//! auth challenges, and retryable status codes. Every recovered failure
//! is kept and attached to whatever error finally surfaces.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use http::header::{self, HeaderMap};
use http::{Method, StatusCode, Uri};
use tracing::{debug, trace};

use crate::body::ResponseBody;
use crate::client::call::CallContext;
use crate::client::chain::{BoxFuture, Chain, Interceptor};
use crate::conn::exchange::ExchangeConn;
use crate::error::{Error, Result};
use crate::proto::h2::Reason;
use crate::request::Request;
use crate::response::Response;

/// Past this many follow-ups the server is leading us in circles.
const MAX_FOLLOW_UPS: usize = 20;

pub(crate) struct RetryAndFollowUp;

impl RetryAndFollowUp {
    pub(crate) fn new() -> RetryAndFollowUp {
        RetryAndFollowUp
    }
}

impl Interceptor for RetryAndFollowUp {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.context().clone();
            let mut chain = chain;
            let mut request = chain.take_request();
            let mut follow_up_count = 0usize;
            let mut prior_response: Option<Response> = None;
            let mut recovered: Vec<Error> = Vec::new();

            loop {
                if ctx.cancel.is_canceled() {
                    return Err(attach(Error::new_canceled(), recovered));
                }
                ctx.request_started.store(false, Ordering::SeqCst);
                // Cloned before the bridge decorates it, so follow-ups
                // start from the caller's request.
                let template = request.try_clone();

                let mut response = match chain.proceed(request).await {
                    Ok(response) => response,
                    Err(err) => {
                        let started = ctx.request_started.load(Ordering::SeqCst);
                        let replayable = template.is_some();
                        if recoverable(&ctx, &err, started, replayable).await {
                            match template {
                                Some(again) => {
                                    debug!("recovering from {}", err);
                                    recovered.push(err);
                                    request = again;
                                    continue;
                                }
                                None => return Err(attach(err, recovered)),
                            }
                        }
                        return Err(attach(err, recovered));
                    }
                };

                if let Some(prior) = prior_response.take() {
                    response.set_prior(prior);
                }

                let follow_up = follow_up(&ctx, &response, template.as_ref())?;
                let next = match follow_up {
                    Some(next) => next,
                    None => return Ok(response),
                };

                follow_up_count += 1;
                if follow_up_count > MAX_FOLLOW_UPS {
                    return Err(attach(
                        Error::new_too_many_follow_ups(follow_up_count),
                        recovered,
                    ));
                }
                trace!(
                    "follow-up #{} -> {} {}",
                    follow_up_count,
                    next.method(),
                    next.uri()
                );

                // The prior body is of no further use. Drain small ones
                // so the connection can be reused; discarding a large one
                // costs the connection instead.
                let body = response.replace_body(ResponseBody::empty());
                drain(body).await;
                prior_response = Some(response);
                request = next;
            }
        })
    }
}

/// Reads a discarded body to completion, up to a small budget.
async fn drain(mut body: ResponseBody) {
    const DRAIN_BUDGET: usize = 256 * 1024;
    let mut read = 0usize;
    loop {
        match body.chunk().await {
            Ok(Some(chunk)) => {
                read += chunk.len();
                if read > DRAIN_BUDGET {
                    // Too big to be worth the connection; drop it.
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

fn attach(mut err: Error, recovered: Vec<Error>) -> Error {
    for earlier in recovered {
        err.push_suppressed(earlier);
    }
    err
}

/// Whether a failed attempt may be retried at all.
async fn recoverable(
    ctx: &Arc<CallContext>,
    err: &Error,
    request_started: bool,
    replayable: bool,
) -> bool {
    if !ctx.client.conf().retry_on_connection_failure {
        return false;
    }
    if ctx.cancel.is_canceled() || err.is_canceled() || err.is_user() {
        return false;
    }
    if err.is_protocol() {
        // The one exception: a refused HTTP/2 stream was never processed
        // by the peer and may be replayed on a fresh connection.
        return matches!(err.kind(), crate::error::Kind::Http2)
            && err.h2_reason() == Reason::REFUSED_STREAM;
    }
    if err.is_tls() {
        // Only the handshake itself is worth another route; verification
        // verdicts will not change.
        return matches!(
            err.kind(),
            crate::error::Kind::Tls(crate::error::Tls::Handshake)
        ) && ctx.has_more_routes().await;
    }
    if request_started && !replayable {
        // A one-shot body already hit the wire.
        return false;
    }
    if err.is_timeout() && request_started {
        return false;
    }
    if err.is_io() || err.is_connect() || err.is_timeout() || err.is_incomplete_message() {
        return ctx.has_more_routes().await || !request_started;
    }
    false
}

/// Derives the follow-up request a response demands, if any.
fn follow_up(
    ctx: &Arc<CallContext>,
    response: &Response,
    template: Option<&Request>,
) -> Result<Option<Request>> {
    let conf = ctx.client.conf();
    let status = response.status();

    match status {
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            let route = match connection_route(response) {
                Some(route) => route,
                None => return Ok(None),
            };
            Ok(conf.proxy_authenticator.authenticate(&route, response))
        }
        StatusCode::UNAUTHORIZED => {
            let route = match connection_route(response) {
                Some(route) => route,
                None => return Ok(None),
            };
            Ok(conf.authenticator.authenticate(&route, response))
        }
        StatusCode::MULTIPLE_CHOICES
        | StatusCode::MOVED_PERMANENTLY
        | StatusCode::FOUND
        | StatusCode::SEE_OTHER
        | StatusCode::TEMPORARY_REDIRECT
        | StatusCode::PERMANENT_REDIRECT => build_redirect(ctx, response, template),
        StatusCode::REQUEST_TIMEOUT => {
            // Retry once, with the body, unless the server asked us to
            // wait or we already retried a 408.
            if !conf.retry_on_connection_failure {
                return Ok(None);
            }
            if prior_status(response) == Some(StatusCode::REQUEST_TIMEOUT) {
                return Ok(None);
            }
            if retry_after(response.headers()).unwrap_or(0) > 0 {
                return Ok(None);
            }
            Ok(template.and_then(|t| t.try_clone()))
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            if prior_status(response) == Some(StatusCode::SERVICE_UNAVAILABLE) {
                return Ok(None);
            }
            // Only an explicit "come back immediately" is worth a retry.
            if retry_after(response.headers()) == Some(0) {
                return Ok(template.and_then(|t| t.try_clone()));
            }
            Ok(None)
        }
        StatusCode::MISDIRECTED_REQUEST => {
            // Our coalesced connection was the wrong choice for this
            // host. Revoke coalescing and replay on a fresh connection.
            let conn = match response.extensions().get::<ExchangeConn>() {
                Some(ExchangeConn(conn)) => conn.clone(),
                None => return Ok(None),
            };
            let was_coalesced =
                !conn.route().address().host().eq_ignore_ascii_case(
                    response.uri().host().unwrap_or_default(),
                );
            if !was_coalesced {
                return Ok(None);
            }
            if prior_status(response) == Some(StatusCode::MISDIRECTED_REQUEST) {
                return Ok(None);
            }
            conn.set_no_coalesced_exchanges();
            Ok(template.and_then(|t| t.try_clone()))
        }
        _ => Ok(None),
    }
}

fn prior_status(response: &Response) -> Option<StatusCode> {
    response.prior().map(|prior| prior.status())
}

fn connection_route(response: &Response) -> Option<crate::connect::Route> {
    response
        .extensions()
        .get::<ExchangeConn>()
        .map(|ExchangeConn(conn)| conn.route().clone())
}

/// `Retry-After` in seconds. Anything that is not a non-negative integer
/// (an HTTP-date, junk) means "later than any sensible deadline".
fn retry_after(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    match value.trim().parse::<u64>() {
        Ok(seconds) => Some(seconds),
        Err(_) => {
            if let Ok(date) = httpdate::parse_http_date(value.trim()) {
                trace!("Retry-After is a date ({:?}); treating as indefinite", date);
            }
            Some(u64::MAX)
        }
    }
}

fn build_redirect(
    ctx: &Arc<CallContext>,
    response: &Response,
    template: Option<&Request>,
) -> Result<Option<Request>> {
    let conf = ctx.client.conf();
    if !conf.follow_redirects {
        return Ok(None);
    }
    let location = match response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(location) => location,
        None => return Ok(None),
    };
    let next_uri = match resolve_location(response.uri(), location) {
        Some(uri) => uri,
        None => return Ok(None),
    };

    // Switching between https and http needs explicit permission.
    if next_uri.scheme_str() != response.uri().scheme_str() && !conf.follow_ssl_redirects {
        return Ok(None);
    }

    let status = response.status();
    let method = response.method().clone();
    // 307/308 replay the request as-is; PROPFIND never converts; the
    // rest become GET (HEAD stays HEAD) and drop the body.
    let preserve_method = status == StatusCode::TEMPORARY_REDIRECT
        || status == StatusCode::PERMANENT_REDIRECT
        || method.as_str() == "PROPFIND";

    let (next_method, body) = if preserve_method {
        let body = match template.and_then(|t| t.try_clone()) {
            Some(t) => t.into_parts().3,
            None if method == Method::GET || method == Method::HEAD => crate::Body::empty(),
            // Cannot replay a one-shot body across a redirect.
            None => return Ok(None),
        };
        (method, body)
    } else if method == Method::HEAD {
        (Method::HEAD, crate::Body::empty())
    } else {
        (Method::GET, crate::Body::empty())
    };

    let mut headers = template
        .map(|t| t.headers().clone())
        .unwrap_or_default();
    if !preserve_method {
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONTENT_TYPE);
    }
    // Credentials never cross hosts.
    let crossing_hosts = !same_host(response.uri(), &next_uri);
    if crossing_hosts {
        headers.remove(header::AUTHORIZATION);
        headers.remove(header::COOKIE);
    }

    Ok(Some(Request::from_parts(
        next_method,
        next_uri,
        headers,
        body,
        http::Extensions::new(),
    )))
}

fn same_host(a: &Uri, b: &Uri) -> bool {
    match (a.host(), b.host()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

/// Resolves a `Location` header against the current URI, RFC 3986 style.
pub(crate) fn resolve_location(base: &Uri, location: &str) -> Option<Uri> {
    if location.is_empty() {
        return None;
    }
    // Absolute.
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() {
            return Some(uri);
        }
    }
    let scheme = base.scheme_str()?;
    let authority = base.authority()?.as_str();

    let target = if let Some(rest) = location.strip_prefix("//") {
        // Network-path reference: keep the scheme only.
        format!("{}://{}", scheme, rest)
    } else if location.starts_with('/') {
        format!("{}://{}{}", scheme, authority, location)
    } else if let Some(query) = location.strip_prefix('?') {
        format!("{}://{}{}?{}", scheme, authority, base.path(), query)
    } else {
        // Relative path: merge with the base directory.
        let base_path = base.path();
        let dir = match base_path.rfind('/') {
            Some(i) => &base_path[..=i],
            None => "/",
        };
        format!(
            "{}://{}{}",
            scheme,
            authority,
            remove_dot_segments(&format!("{}{}", dir, location))
        )
    };
    target.parse().ok()
}

fn remove_dot_segments(path: &str) -> String {
    let (path, query) = match path.find('?') {
        Some(i) => (&path[..i], Some(&path[i..])),
        None => (path, None),
    };
    let mut output: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." => {}
            ".." => {
                output.pop();
            }
            other => output.push(other),
        }
    }
    let mut result = output.join("/");
    if !result.starts_with('/') {
        result.insert(0, '/');
    }
    if path.ends_with("/.") || path.ends_with("/..") {
        result.push('/');
    }
    if let Some(query) = query {
        result.push_str(query);
    }
    result
}
