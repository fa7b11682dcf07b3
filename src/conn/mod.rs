//! Live transport connections.
//!
//! A [`Connection`] is one TCP (possibly TLS) socket carrying either a
//! serial HTTP/1 codec or a multiplexed HTTP/2 engine. The pool owns
//! connections exclusively; exchanges borrow them through call
//! references.

pub(crate) mod connect;
pub(crate) mod exchange;
pub(crate) mod pool;

pub(crate) use self::pool::Pool;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connect::{Address, Protocol, Route};
use crate::proto::h1::Http1Codec;
use crate::proto::h2::Http2Connection;
use crate::tls::{Handshake, TlsStream};

/// The transport under a connection: a plain socket or a TLS session.
pub(crate) enum Stream {
    Plain(TcpStream),
    Tls(Box<dyn TlsStream>),
}

impl Stream {
    /// A cheap, non-blocking liveness probe for the extensive health
    /// check: an idle healthy socket has nothing to read.
    fn probe_open(&self) -> bool {
        match self {
            Stream::Plain(tcp) => {
                let mut buf = [0u8; 1];
                match tcp.try_read(&mut buf) {
                    // EOF, or the server spoke out of turn.
                    Ok(_) => false,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
                    Err(_) => false,
                }
            }
            // The TLS capability owns the inner socket; without a peek
            // surface we treat it as open and let the exchange find out.
            Stream::Tls(_) => true,
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Stream::Tls(tls) => Pin::new(tls).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Stream::Tls(tls) => Pin::new(tls).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Stream::Tls(tls) => Pin::new(tls).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Stream::Tls(tls) => Pin::new(tls).poll_shutdown(cx),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Plain(_) => f.write_str("Stream::Plain"),
            Stream::Tls(_) => f.write_str("Stream::Tls"),
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A borrow of a connection by one call, for accounting and leak logs.
#[derive(Debug, Clone)]
pub(crate) struct CallReference {
    pub(crate) call_id: u64,
    pub(crate) acquired_at: Instant,
}

/// One live transport connection.
pub(crate) struct Connection {
    id: u64,
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    /// Present iff the connection is multiplexed.
    h2: Option<Http2Connection>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// The HTTP/1 codec, parked here between exchanges. `None` while an
    /// exchange has it checked out, and always `None` for HTTP/2.
    codec: Option<Http1Codec<Stream>>,
    calls: Vec<CallReference>,
    idle_at: Instant,
    no_new_exchanges: bool,
    no_coalesced_exchanges: bool,
    allocation_limit: usize,
}

impl Connection {
    pub(crate) fn new_h1(route: Route, handshake: Option<Handshake>, codec: Http1Codec<Stream>) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            protocol: Protocol::Http1,
            handshake,
            h2: None,
            inner: Mutex::new(Inner {
                codec: Some(codec),
                calls: Vec::new(),
                idle_at: Instant::now(),
                no_new_exchanges: false,
                no_coalesced_exchanges: false,
                allocation_limit: 1,
            }),
        }
    }

    pub(crate) fn new_h2(
        route: Route,
        handshake: Option<Handshake>,
        engine: Http2Connection,
        allocation_limit: usize,
    ) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route,
            protocol: Protocol::Http2,
            handshake,
            h2: Some(engine),
            inner: Mutex::new(Inner {
                codec: None,
                calls: Vec::new(),
                idle_at: Instant::now(),
                no_new_exchanges: false,
                no_coalesced_exchanges: false,
                allocation_limit,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn route(&self) -> &Route {
        &self.route
    }

    pub(crate) fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub(crate) fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        self.h2.is_some()
    }

    pub(crate) fn h2(&self) -> Option<&Http2Connection> {
        self.h2.as_ref()
    }

    /// Once set, no new exchange may use this connection. Monotonic.
    pub(crate) fn set_no_new_exchanges(&self) {
        self.inner.lock().unwrap().no_new_exchanges = true;
    }

    pub(crate) fn no_new_exchanges(&self) -> bool {
        self.inner.lock().unwrap().no_new_exchanges
    }

    /// Revokes coalescing after a `421 Misdirected Request`.
    pub(crate) fn set_no_coalesced_exchanges(&self) {
        self.inner.lock().unwrap().no_coalesced_exchanges = true;
    }

    pub(crate) fn call_count(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    pub(crate) fn idle_at(&self) -> Option<Instant> {
        let inner = self.inner.lock().unwrap();
        if inner.calls.is_empty() {
            Some(inner.idle_at)
        } else {
            None
        }
    }

    pub(crate) fn oldest_reference(&self) -> Option<CallReference> {
        self.inner.lock().unwrap().calls.first().cloned()
    }

    /// Whether this connection may carry an exchange for `address`.
    ///
    /// Either the address is fully equivalent to this connection's, or
    /// this is a multiplexed connection whose certificate also covers the
    /// other host (coalescing).
    pub(crate) fn is_eligible(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.no_new_exchanges || inner.calls.len() >= self.effective_allocation_limit(&inner) {
            return false;
        }
        drop(inner);

        if !self.route.address().equal_non_host(address) {
            return false;
        }
        if self.route.address().host() == address.host() {
            return true;
        }

        // Coalesced exchanges: HTTP/2 only, and only when we can prove
        // the certificate covers the other host.
        if self.h2.is_none() {
            return false;
        }
        if self.inner.lock().unwrap().no_coalesced_exchanges {
            return false;
        }
        // The caller may have resolved routes; if so, this connection's
        // peer must be among them.
        if let Some(routes) = routes {
            if !routes
                .iter()
                .any(|r| r.proxy().is_direct() && r.socket_addr() == self.route.socket_addr())
            {
                return false;
            }
        }
        let (handshake, tls) = match (self.handshake.as_ref(), address.tls()) {
            (Some(handshake), Some(tls)) => (handshake, tls),
            _ => return false,
        };
        if !tls.hostname_verifier.verify(address.host(), handshake) {
            return false;
        }
        if tls
            .certificate_pinner
            .check(address.host(), handshake.peer_certificates())
            .is_err()
        {
            return false;
        }
        true
    }

    fn effective_allocation_limit(&self, inner: &Inner) -> usize {
        match &self.h2 {
            Some(engine) => std::cmp::min(
                inner.allocation_limit,
                engine.max_concurrent_streams(),
            ),
            None => inner.allocation_limit,
        }
    }

    /// Health check before reuse. The light check trusts recent activity;
    /// the extensive one probes the socket.
    pub(crate) fn is_healthy(&self, extensive: bool) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.no_new_exchanges {
            return false;
        }
        if let Some(engine) = &self.h2 {
            return !engine.is_closed();
        }
        let codec = match &inner.codec {
            Some(codec) => codec,
            // Checked out by a live exchange; it is in use, not sick.
            None => return true,
        };
        if codec.is_closed() {
            return false;
        }
        if extensive {
            return codec.io_ref().probe_open();
        }
        true
    }

    /// Borrows the connection for one exchange.
    ///
    /// For HTTP/1 this checks the codec out; at most one exchange can
    /// hold it. Returns `None` if the connection cannot take the
    /// exchange.
    pub(crate) fn reserve(&self, call_id: u64) -> Option<Borrowed> {
        let mut inner = self.inner.lock().unwrap();
        if inner.no_new_exchanges || inner.calls.len() >= self.effective_allocation_limit(&inner) {
            return None;
        }
        let borrowed = match &self.h2 {
            Some(engine) => Borrowed::H2(engine.clone()),
            None => match inner.codec.take() {
                Some(codec) => Borrowed::H1(codec),
                None => return None,
            },
        };
        inner.calls.push(CallReference {
            call_id,
            acquired_at: Instant::now(),
        });
        trace!("conn {} reserved by call {}", self.id, call_id);
        Some(borrowed)
    }

    /// Returns an HTTP/1 codec after an exchange. A poisoned codec
    /// poisons the connection.
    pub(crate) fn park_codec(&self, codec: Http1Codec<Stream>) {
        let mut inner = self.inner.lock().unwrap();
        if codec.is_closed() {
            inner.no_new_exchanges = true;
        }
        debug_assert!(inner.codec.is_none());
        inner.codec = Some(codec);
    }

    /// Drops the call's reference; the connection may become idle.
    pub(crate) fn release(&self, call_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(i) = inner.calls.iter().position(|r| r.call_id == call_id) {
            inner.calls.remove(i);
        } else {
            debug!("release of unknown call {} on conn {}", call_id, self.id);
        }
        if inner.calls.is_empty() {
            inner.idle_at = Instant::now();
        }
    }

    /// Closes the transport. Idempotent; the socket drops with the codec.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.no_new_exchanges = true;
        inner.codec = None;
        drop(inner);
        if let Some(engine) = &self.h2 {
            let engine = engine.clone();
            tokio::spawn(async move { engine.shutdown().await });
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// What an exchange gets when it borrows a connection.
pub(crate) enum Borrowed {
    H1(Http1Codec<Stream>),
    H2(Http2Connection),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::client::NoAuth;
    use crate::connect::dns::StaticDns;
    use crate::connect::{NoProxy, Proxy};
    use crate::proto::h2::{self, Http2Connection};
    use crate::runner::TaskRunner;
    use crate::tls::{
        Handshake, PeerCertificate, StrictHostnameVerifier, TlsConfig, TlsConnector, TlsStream,
    };

    struct UnreachableTls;

    impl TlsConnector for UnreachableTls {
        fn connect(
            &self,
            _stream: tokio::net::TcpStream,
            _host: &str,
            _alpn: &[Protocol],
            _spec: &crate::connect::ConnectionSpec,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = std::io::Result<Box<dyn TlsStream>>>
                    + Send,
            >,
        > {
            Box::pin(async { Err(std::io::ErrorKind::Unsupported.into()) })
        }
    }

    struct Caps {
        dns: Arc<dyn crate::connect::Dns>,
        tls: TlsConfig,
        proxy_selector: Arc<dyn crate::connect::ProxySelector>,
        proxy_auth: Arc<dyn crate::client::Authenticator>,
    }

    impl Caps {
        fn new() -> Caps {
            Caps {
                dns: Arc::new(StaticDns::new()),
                tls: TlsConfig::new(Arc::new(UnreachableTls)),
                proxy_selector: Arc::new(NoProxy),
                proxy_auth: Arc::new(NoAuth),
            }
        }

        /// Addresses that differ only in host share every capability, which
        /// is the precondition for coalescing.
        fn address(&self, host: &str) -> Address {
            Address::new(
                host.to_owned(),
                443,
                self.dns.clone(),
                Some(self.tls.clone()),
                None,
                self.proxy_selector.clone(),
                self.proxy_auth.clone(),
                vec![Protocol::Http2, Protocol::Http1],
            )
        }
    }

    fn wildcard_handshake() -> Handshake {
        Handshake::new(
            Some(Protocol::Http2),
            "TLS_AES_128_GCM_SHA256",
            vec![PeerCertificate::new(
                &b"der"[..],
                "cn=wild",
                "cn=ca",
                vec!["*.example.test".to_owned()],
            )],
        )
    }

    /// The peer half is returned so the transport stays open for the
    /// duration of a test.
    async fn h2_engine() -> (Http2Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let conn = Http2Connection::handshake(
            Box::new(client),
            h2::conn::Config {
                ping_interval: None,
                strategy: Arc::new(h2::ReleaseOnConsume),
                runner: TaskRunner::new(),
            },
        )
        .await
        .unwrap();
        (conn, server)
    }

    #[tokio::test]
    async fn coalescing_requires_matching_certificate() {
        let caps = Caps::new();
        let a1 = caps.address("a.example.test");
        let route = Route::new(a1.clone(), Proxy::Direct, "127.0.0.1:443".parse().unwrap());
        let (engine, _peer) = h2_engine().await;
        let conn = Connection::new_h2(route, Some(wildcard_handshake()), engine, 8);

        // Same host: plain equivalence.
        assert!(conn.is_eligible(&caps.address("a.example.test"), None));
        // Other host covered by the wildcard certificate: coalesced.
        assert!(conn.is_eligible(&caps.address("b.example.test"), None));
        // A host outside the certificate is refused.
        assert!(!conn.is_eligible(&caps.address("a.other.test"), None));
    }

    #[tokio::test]
    async fn coalescing_requires_identical_capability_instances() {
        let caps = Caps::new();
        let a1 = caps.address("a.example.test");
        let route = Route::new(a1, Proxy::Direct, "127.0.0.1:443".parse().unwrap());
        let (engine, _peer) = h2_engine().await;
        let conn = Connection::new_h2(route, Some(wildcard_handshake()), engine, 8);

        // An address with its own verifier instance must not coalesce:
        // there is no proof two verifiers agree.
        let mut other_caps = Caps::new();
        other_caps.tls = TlsConfig::new(Arc::new(UnreachableTls))
            .hostname_verifier(Arc::new(StrictHostnameVerifier));
        assert!(!conn.is_eligible(&other_caps.address("b.example.test"), None));
    }

    #[tokio::test]
    async fn coalescing_respects_resolved_routes() {
        let caps = Caps::new();
        let a1 = caps.address("a.example.test");
        let route = Route::new(a1, Proxy::Direct, "127.0.0.1:443".parse().unwrap());
        let (engine, _peer) = h2_engine().await;
        let conn = Connection::new_h2(route, Some(wildcard_handshake()), engine, 8);

        let b = caps.address("b.example.test");
        let matching = [Route::new(
            b.clone(),
            Proxy::Direct,
            "127.0.0.1:443".parse().unwrap(),
        )];
        let elsewhere = [Route::new(
            b.clone(),
            Proxy::Direct,
            "192.0.2.9:443".parse().unwrap(),
        )];
        assert!(conn.is_eligible(&b, Some(&matching)));
        // The caller resolved b elsewhere; this connection's peer is not
        // among its addresses.
        assert!(!conn.is_eligible(&b, Some(&elsewhere)));
    }

    #[tokio::test]
    async fn misdirected_request_revokes_coalescing() {
        let caps = Caps::new();
        let a1 = caps.address("a.example.test");
        let route = Route::new(a1, Proxy::Direct, "127.0.0.1:443".parse().unwrap());
        let (engine, _peer) = h2_engine().await;
        let conn = Connection::new_h2(route, Some(wildcard_handshake()), engine, 8);

        let b = caps.address("b.example.test");
        assert!(conn.is_eligible(&b, None));
        conn.set_no_coalesced_exchanges();
        assert!(!conn.is_eligible(&b, None));
        // Same-host exchanges continue.
        assert!(conn.is_eligible(&caps.address("a.example.test"), None));
    }

    #[tokio::test]
    async fn no_new_exchanges_is_monotonic_and_blocks_reserve() {
        let caps = Caps::new();
        let a1 = caps.address("a.example.test");
        let route = Route::new(a1.clone(), Proxy::Direct, "127.0.0.1:443".parse().unwrap());
        let (engine, _peer) = h2_engine().await;
        let conn = Connection::new_h2(route, Some(wildcard_handshake()), engine, 8);

        assert!(conn.reserve(1).is_some());
        conn.set_no_new_exchanges();
        assert!(conn.no_new_exchanges());
        assert!(!conn.is_eligible(&a1, None));
        assert!(conn.reserve(2).is_none());
        // Releasing the earlier borrow does not resurrect it.
        conn.release(1);
        assert!(conn.no_new_exchanges());
    }

    #[tokio::test]
    async fn allocation_limit_caps_concurrent_streams() {
        let caps = Caps::new();
        let a1 = caps.address("a.example.test");
        let route = Route::new(a1, Proxy::Direct, "127.0.0.1:443".parse().unwrap());
        let (engine, _peer) = h2_engine().await;
        let conn = Connection::new_h2(route, Some(wildcard_handshake()), engine, 2);

        assert!(conn.reserve(1).is_some());
        assert!(conn.reserve(2).is_some());
        assert!(conn.reserve(3).is_none());
        conn.release(1);
        assert!(conn.reserve(4).is_some());
    }
}
