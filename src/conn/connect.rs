//! Establishing new connections: TCP dial, proxy tunnels, TLS, ALPN.

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Connection, Stream};
use crate::body::ResponseBody;
use crate::connect::{ConnectionSpec, Protocol, Route};
use crate::error::{Error, Result};
use crate::proto::h1::{role, Http1Codec};
use crate::proto::h2::{self, Http2Connection};
use crate::proto::{BodyLength, RequestHead};
use crate::response::Response;
use crate::runner::TaskRunner;
use crate::tls::TlsConfig;

/// A proxy demanding authentication over and over is not making progress.
const MAX_TUNNEL_ATTEMPTS: usize = 21;

/// Everything `connect` needs besides the route itself.
pub(crate) struct ConnectSettings {
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) strategy: Arc<dyn h2::WindowStrategy>,
    pub(crate) runner: TaskRunner,
}

/// Opens a transport to `route` and wraps it in a [`Connection`].
///
/// TLS connection specs are tried in order; a fallback-safe handshake
/// failure moves on to the next spec on a freshly dialed socket.
pub(crate) async fn connect(route: &Route, settings: &ConnectSettings) -> Result<Connection> {
    match route.address().tls() {
        None => connect_once(route, settings, None).await,
        Some(tls) => {
            let specs: Vec<&ConnectionSpec> = tls
                .connection_specs
                .iter()
                .filter(|spec| spec.requires_tls())
                .collect();
            if specs.is_empty() {
                return Err(Error::new_connect("no TLS connection specs configured"));
            }
            let mut last_err = None;
            let count = specs.len();
            for (i, spec) in specs.into_iter().enumerate() {
                match connect_once(route, settings, Some((tls, spec))).await {
                    Ok(conn) => return Ok(conn),
                    Err(err) => {
                        if i + 1 < count && ConnectionSpec::is_fallback_safe(&err) {
                            debug!(
                                "handshake with {} failed; falling back to next spec: {}",
                                spec.name(),
                                err
                            );
                            last_err = Some(err);
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
            Err(last_err.expect("at least one spec was tried"))
        }
    }
}

async fn connect_once(
    route: &Route,
    settings: &ConnectSettings,
    tls: Option<(&TlsConfig, &ConnectionSpec)>,
) -> Result<Connection> {
    trace!("dialing {:?}", route);
    let tcp = tokio::time::timeout(
        settings.connect_timeout,
        TcpStream::connect(route.socket_addr()),
    )
    .await
    .map_err(|_| Error::new_connect_timeout())?
    .map_err(Error::new_connect)?;
    tcp.set_nodelay(true).map_err(Error::new_connect)?;

    let tcp = match route.proxy() {
        crate::connect::Proxy::Socks { .. } => socks_handshake(route, tcp).await?,
        crate::connect::Proxy::Http { .. } if route.requires_tunnel() => {
            tunnel(route, tcp).await?
        }
        _ => tcp,
    };

    match tls {
        None => {
            let stream = Stream::Plain(tcp);
            // Cleartext HTTP/2 needs prior knowledge: the caller asked
            // for only-h2 explicitly.
            if route.address().protocols() == [Protocol::Http2] {
                let engine = Http2Connection::handshake(
                    Box::new(stream),
                    h2::conn::Config {
                        ping_interval: settings.ping_interval,
                        strategy: settings.strategy.clone(),
                        runner: settings.runner.clone(),
                    },
                )
                .await?;
                Ok(Connection::new_h2(route.clone(), None, engine, usize::MAX))
            } else {
                Ok(Connection::new_h1(
                    route.clone(),
                    None,
                    Http1Codec::new(stream),
                ))
            }
        }
        Some((tls_config, spec)) => {
            let host = route.address().host();
            let tls_stream = tls_config
                .connector
                .connect(tcp, host, route.address().protocols(), spec)
                .await
                .map_err(Error::new_tls_handshake)?;
            let handshake = tls_stream.handshake();

            if !tls_config.hostname_verifier.verify(host, &handshake) {
                return Err(Error::new_tls_hostname(host));
            }
            tls_config
                .certificate_pinner
                .check(host, handshake.peer_certificates())?;

            let negotiated = handshake.protocol().unwrap_or(Protocol::Http1);
            let stream = Stream::Tls(tls_stream);
            match negotiated {
                Protocol::Http2 => {
                    let engine = Http2Connection::handshake(
                        Box::new(stream),
                        h2::conn::Config {
                            ping_interval: settings.ping_interval,
                            strategy: settings.strategy.clone(),
                            runner: settings.runner.clone(),
                        },
                    )
                    .await?;
                    Ok(Connection::new_h2(
                        route.clone(),
                        Some(handshake),
                        engine,
                        usize::MAX,
                    ))
                }
                Protocol::Http1 => Ok(Connection::new_h1(
                    route.clone(),
                    Some(handshake),
                    Http1Codec::new(stream),
                )),
            }
        }
    }
}

/// Establishes a CONNECT tunnel through an HTTP proxy, handling `407`
/// challenges through the proxy authenticator.
async fn tunnel(route: &Route, tcp: TcpStream) -> Result<TcpStream> {
    let host = route.address().host();
    let port = route.address().port();
    let authority = format!("{}:{}", host, port);

    let mut proxy_authorization: Option<HeaderValue> = None;
    let mut codec = Http1Codec::new(Stream::Plain(tcp));

    for _attempt in 0..MAX_TUNNEL_ATTEMPTS {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::HOST,
            HeaderValue::from_str(&authority).map_err(Error::new_connect)?,
        );
        headers.insert(
            http::header::HeaderName::from_static("proxy-connection"),
            HeaderValue::from_static("Keep-Alive"),
        );
        if let Some(value) = &proxy_authorization {
            headers.insert(http::header::PROXY_AUTHORIZATION, value.clone());
        }

        let head = RequestHead {
            method: Method::CONNECT,
            target: authority.clone(),
            headers,
        };
        codec.write_request_head(&head, BodyLength::None).await?;
        codec.finish_body().await?;
        let response = codec.read_response_head().await?;

        match response.status {
            StatusCode::OK => {
                let (stream, leftover) = codec.into_parts();
                if !leftover.is_empty() {
                    // The proxy talked past the tunnel response.
                    return Err(Error::new_connect("proxy sent data before the tunnel"));
                }
                match stream {
                    Stream::Plain(tcp) => return Ok(tcp),
                    Stream::Tls(_) => unreachable!("tunnel runs on a plain socket"),
                }
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                // Ask the authenticator for credentials; giving up is a
                // connect failure, not an auth error.
                let challenge = Response::new(
                    response.status,
                    response.version,
                    response.headers,
                    ResponseBody::empty(),
                    format!("http://{}/", authority)
                        .parse()
                        .map_err(|e: http::uri::InvalidUri| Error::new_connect(e))?,
                    Method::CONNECT,
                    None,
                    std::time::SystemTime::now(),
                    std::time::SystemTime::now(),
                );
                let request = route
                    .address()
                    .proxy_authenticator()
                    .authenticate(route, &challenge)
                    .ok_or_else(|| {
                        Error::new_connect("proxy authentication required and not provided")
                    })?;
                proxy_authorization = request
                    .headers()
                    .get(http::header::PROXY_AUTHORIZATION)
                    .cloned();
                if proxy_authorization.is_none() {
                    return Err(Error::new_connect(
                        "proxy authenticator returned no credentials",
                    ));
                }
                // CONNECT responses carry no body; loop and try again.
                codec.finish_response(true);
                if codec.is_closed() {
                    return Err(Error::new_connect("proxy closed during authentication"));
                }
            }
            other => {
                return Err(Error::new_connect(format!(
                    "unexpected tunnel response: {}",
                    other
                )));
            }
        }
    }
    Err(Error::new_connect("too many tunnel authentication attempts"))
}

/// A minimal SOCKS5 handshake: no authentication, domain addressing with
/// the unresolved origin host so the proxy does the resolving it sees fit.
async fn socks_handshake(route: &Route, mut tcp: TcpStream) -> Result<TcpStream> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let host = route.address().host();
    let port = route.address().port();
    if host.len() > 255 {
        return Err(Error::new_connect("hostname too long for socks"));
    }

    // Greeting: version 5, one method, "no authentication".
    tcp.write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(Error::new_connect)?;
    let mut reply = [0u8; 2];
    tcp.read_exact(&mut reply).await.map_err(Error::new_connect)?;
    if reply != [0x05, 0x00] {
        return Err(Error::new_connect("socks proxy refused no-auth"));
    }

    // CONNECT request with a domain address.
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    tcp.write_all(&request).await.map_err(Error::new_connect)?;

    let mut head = [0u8; 4];
    tcp.read_exact(&mut head).await.map_err(Error::new_connect)?;
    if head[1] != 0x00 {
        return Err(Error::new_connect(format!(
            "socks connect failed: code {}",
            head[1]
        )));
    }
    // Skip the bound address.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            tcp.read_exact(&mut len).await.map_err(Error::new_connect)?;
            len[0] as usize
        }
        _ => return Err(Error::new_connect("socks proxy sent a bad address type")),
    };
    let mut skip = vec![0u8; addr_len + 2];
    tcp.read_exact(&mut skip).await.map_err(Error::new_connect)?;

    Ok(tcp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{Address, NoProxy, Proxy};
    use crate::proto::h2::ReleaseOnConsume;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings() -> ConnectSettings {
        ConnectSettings {
            connect_timeout: Duration::from_secs(5),
            ping_interval: None,
            strategy: Arc::new(ReleaseOnConsume),
            runner: TaskRunner::new(),
        }
    }

    fn route_to(addr: SocketAddr, proxy: Proxy) -> Route {
        let address = Address::new(
            "origin.example.test".to_owned(),
            443,
            Arc::new(crate::connect::dns::StaticDns::new()),
            None,
            Some(proxy.clone()),
            Arc::new(NoProxy),
            Arc::new(crate::client::NoAuth),
            vec![Protocol::Http1],
        );
        Route::new(address, proxy, addr)
    }

    #[tokio::test]
    async fn plain_connect_produces_h1_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let route = route_to(addr, Proxy::Direct);
        let conn = connect(&route, &settings()).await.unwrap();
        assert_eq!(conn.protocol(), Protocol::Http1);
        assert!(!conn.is_multiplexed());
        let _ = accept.await.unwrap();
    }

    #[tokio::test]
    async fn connect_timeout_is_reported_as_such() {
        // RFC 5737 TEST-NET address: packets go nowhere.
        let route = route_to("192.0.2.1:81".parse().unwrap(), Proxy::Direct);
        let mut quick = settings();
        quick.connect_timeout = Duration::from_millis(50);
        let err = connect(&route, &quick).await.unwrap_err();
        assert!(err.is_connect());
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn socks_handshake_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            sock.read_exact(&mut rest).await.unwrap();
            // Reply: success, bound to 0.0.0.0:0.
            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let route = route_to(addr, Proxy::socks("socks.example.test", 1080));
        let conn = connect(&route, &settings()).await.unwrap();
        assert_eq!(conn.protocol(), Protocol::Http1);
        server.await.unwrap();
    }
}
