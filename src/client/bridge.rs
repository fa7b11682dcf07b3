//! The application-to-network bridge.
//!
//! Fills in the headers every request needs (`Host`, `Connection`,
//! `Accept-Encoding`, `Cookie`, `User-Agent`) and undoes the transfer
//! encodings on the way back: when it asked for gzip on the caller's
//! behalf, it transparently decompresses and strips the bookkeeping
//! headers.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzDecoder;
use http::header::{self, HeaderValue};
use http::Uri;
use tracing::trace;

use crate::body::{ChunkSource, ResponseBody};
use crate::client::chain::{BoxFuture, Chain, Interceptor};
use crate::error::{Error, Result};
use crate::response::Response;

pub(crate) struct Bridge;

impl Bridge {
    pub(crate) fn new() -> Bridge {
        Bridge
    }
}

impl Interceptor for Bridge {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.context().clone();
            let conf = ctx.client.conf();
            let mut chain = chain;
            let mut request = chain.take_request();
            let uri = request.uri().clone();

            {
                let host = host_header(&uri)?;
                let headers = request.headers_mut();
                if !headers.contains_key(header::HOST) {
                    headers.insert(header::HOST, host);
                }
                if !headers.contains_key(header::CONNECTION) {
                    headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
                }
                if !headers.contains_key(header::USER_AGENT) {
                    if let Ok(value) = HeaderValue::from_str(&conf.user_agent) {
                        headers.insert(header::USER_AGENT, value);
                    }
                }
                if let Some(cookies) = conf.cookie_store.load(&uri) {
                    if let Ok(value) = HeaderValue::from_str(&cookies) {
                        headers.insert(header::COOKIE, value);
                    }
                }
            }

            // Only decode what we asked for: if the caller set their own
            // Accept-Encoding (or requested a Range), the bytes are theirs.
            let transparent_gzip = !request.headers().contains_key(header::ACCEPT_ENCODING)
                && !request.headers().contains_key(header::RANGE);
            if transparent_gzip {
                request
                    .headers_mut()
                    .insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
            }

            let mut response = chain.proceed(request).await?;

            let set_cookies: Vec<String> = response
                .headers()
                .get_all(header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_owned)
                .collect();
            if !set_cookies.is_empty() {
                conf.cookie_store.save(&uri, set_cookies);
            }

            let gzipped = response
                .headers()
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false);
            if transparent_gzip && gzipped {
                trace!("transparently decoding gzip body");
                response.headers_mut().remove(header::CONTENT_ENCODING);
                response.headers_mut().remove(header::CONTENT_LENGTH);
                let inner = response.replace_body(ResponseBody::empty());
                let _ = response.replace_body(ResponseBody::streamed(
                    None,
                    Box::new(GzipSource::new(inner)),
                ));
            }

            Ok(response)
        })
    }
}

fn host_header(uri: &Uri) -> Result<HeaderValue> {
    let host = uri
        .host()
        .ok_or_else(Error::new_user_absolute_uri_required)?;
    let default_port = match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    };
    let value = match uri.port_u16() {
        Some(port) if port != default_port => format!("{}:{}", host, port),
        _ => host.to_owned(),
    };
    HeaderValue::from_str(&value)
        .map_err(|_| Error::new(crate::error::Kind::Parse(crate::error::Parse::Uri)))
}

/// Incrementally gunzips an inner body.
struct GzipSource {
    inner: ResponseBody,
    decoder: Option<GzDecoder<Vec<u8>>>,
    done: bool,
}

impl GzipSource {
    fn new(inner: ResponseBody) -> GzipSource {
        GzipSource {
            inner,
            decoder: Some(GzDecoder::new(Vec::new())),
            done: false,
        }
    }
}

impl ChunkSource for GzipSource {
    fn next_chunk(
        &mut self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<Bytes>>> + Send + '_>>
    {
        Box::pin(async move {
            loop {
                if self.done {
                    return Ok(None);
                }
                match self.inner.chunk().await? {
                    Some(data) => {
                        let decoder = self.decoder.as_mut().expect("decoder until done");
                        decoder.write_all(&data).map_err(Error::new_body)?;
                        decoder.flush().map_err(Error::new_body)?;
                        let out = std::mem::take(decoder.get_mut());
                        if !out.is_empty() {
                            return Ok(Some(Bytes::from(out)));
                        }
                        // Not enough compressed input yet; read more.
                    }
                    None => {
                        self.done = true;
                        let decoder = self.decoder.take().expect("decoder until done");
                        let out = decoder.finish().map_err(Error::new_body)?;
                        if out.is_empty() {
                            return Ok(None);
                        }
                        return Ok(Some(Bytes::from(out)));
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_includes_nonstandard_port() {
        assert_eq!(
            host_header(&"http://a.example.test/".parse().unwrap()).unwrap(),
            "a.example.test"
        );
        assert_eq!(
            host_header(&"http://a.example.test:8080/".parse().unwrap()).unwrap(),
            "a.example.test:8080"
        );
        assert_eq!(
            host_header(&"https://a.example.test:443/".parse().unwrap()).unwrap(),
            "a.example.test"
        );
    }

    #[tokio::test]
    async fn gzip_source_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip world").unwrap();
        let compressed = encoder.finish().unwrap();

        let inner = ResponseBody::full(Bytes::from(compressed));
        let mut source = GzipSource::new(inner);
        let mut out = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello gzip world");
    }
}
