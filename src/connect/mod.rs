//! Addresses, routes, and connection specs.
//!
//! An [`Address`] is the tuple that must match for two requests to share a
//! connection. A [`Route`] is one concrete way to reach an address: which
//! proxy, and which resolved socket address.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::tls::TlsConfig;

pub mod dns;
pub mod proxy;
pub(crate) mod route;

pub use self::dns::{Dns, GaiResolver};
pub use self::proxy::{NoProxy, Proxy, ProxySelector};
pub(crate) use self::route::{RouteDatabase, RouteSelector};

/// Application protocols, in ALPN preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    pub(crate) fn alpn_id(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alpn_id())
    }
}

/// A named bundle of TLS parameters to offer during a handshake.
///
/// Specs are tried in order; on a fallback-safe handshake failure the
/// connect loop retries the same route with the next spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSpec {
    name: &'static str,
    requires_tls: bool,
    tls_versions: Vec<&'static str>,
}

impl ConnectionSpec {
    /// TLS 1.2+ only.
    pub fn modern_tls() -> ConnectionSpec {
        ConnectionSpec {
            name: "modern-tls",
            requires_tls: true,
            tls_versions: vec!["TLSv1.3", "TLSv1.2"],
        }
    }

    /// A widest-compatibility fallback.
    pub fn compatible_tls() -> ConnectionSpec {
        ConnectionSpec {
            name: "compatible-tls",
            requires_tls: true,
            tls_versions: vec!["TLSv1.3", "TLSv1.2", "TLSv1.1", "TLSv1"],
        }
    }

    /// Unencrypted `http:` connections.
    pub fn cleartext() -> ConnectionSpec {
        ConnectionSpec {
            name: "cleartext",
            requires_tls: false,
            tls_versions: vec![],
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn requires_tls(&self) -> bool {
        self.requires_tls
    }

    pub fn tls_versions(&self) -> &[&'static str] {
        &self.tls_versions
    }

    /// Whether a handshake failure under this spec may be retried with the
    /// next spec in the list.
    ///
    /// One predicate for every platform: retry only protocol-level
    /// handshake failures. Certificate verification, hostname, and pinning
    /// failures are verdicts, not compatibility problems, and a timeout is
    /// as likely to recur under any spec.
    pub fn is_fallback_safe(err: &crate::Error) -> bool {
        if err.is_timeout() {
            return false;
        }
        match err.kind() {
            crate::error::Kind::Tls(crate::error::Tls::Handshake) => true,
            _ => false,
        }
    }
}

/// Everything that must be equal for two requests to share a connection.
///
/// Cheaply clonable; equality compares hosts and ports by value and every
/// capability by identity.
#[derive(Clone)]
pub struct Address {
    inner: Arc<AddressInner>,
}

struct AddressInner {
    host: String,
    port: u16,
    dns: Arc<dyn Dns>,
    tls: Option<TlsConfig>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy_authenticator: Arc<dyn crate::client::Authenticator>,
    protocols: Vec<Protocol>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        host: String,
        port: u16,
        dns: Arc<dyn Dns>,
        tls: Option<TlsConfig>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
        proxy_authenticator: Arc<dyn crate::client::Authenticator>,
        protocols: Vec<Protocol>,
    ) -> Address {
        Address {
            inner: Arc::new(AddressInner {
                host,
                port,
                dns,
                tls,
                proxy,
                proxy_selector,
                proxy_authenticator,
                protocols,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_https(&self) -> bool {
        self.inner.tls.is_some()
    }

    pub(crate) fn dns(&self) -> &Arc<dyn Dns> {
        &self.inner.dns
    }

    pub(crate) fn tls(&self) -> Option<&TlsConfig> {
        self.inner.tls.as_ref()
    }

    pub(crate) fn proxy(&self) -> Option<&Proxy> {
        self.inner.proxy.as_ref()
    }

    pub(crate) fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.inner.proxy_selector
    }

    pub(crate) fn proxy_authenticator(&self) -> &Arc<dyn crate::client::Authenticator> {
        &self.inner.proxy_authenticator
    }

    pub(crate) fn protocols(&self) -> &[Protocol] {
        &self.inner.protocols
    }

    /// Full equivalence: required for plain connection reuse.
    pub(crate) fn equivalent(&self, other: &Address) -> bool {
        self.inner.host == other.inner.host && self.equal_non_host(other)
    }

    /// Everything but the host matches. The precondition for HTTP/2
    /// coalescing, where the certificate covers the other host.
    pub(crate) fn equal_non_host(&self, other: &Address) -> bool {
        self.inner.port == other.inner.port
            && Arc::ptr_eq(&self.inner.dns, &other.inner.dns)
            && Arc::ptr_eq(&self.inner.proxy_selector, &other.inner.proxy_selector)
            && Arc::ptr_eq(
                &self.inner.proxy_authenticator,
                &other.inner.proxy_authenticator,
            )
            && self.inner.proxy == other.inner.proxy
            && self.inner.protocols == other.inner.protocols
            && match (&self.inner.tls, &other.inner.tls) {
                (None, None) => true,
                (Some(a), Some(b)) => a.equivalent(b),
                _ => false,
            }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("https", &self.inner.tls.is_some())
            .field("proxy", &self.inner.proxy)
            .finish()
    }
}

/// One concrete way to reach an [`Address`].
#[derive(Clone)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Address, proxy: Proxy, socket_addr: SocketAddr) -> Route {
        Route {
            address,
            proxy,
            socket_addr,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// An HTTP proxy in front of an `https:` address means the connection
    /// must first be tunneled with CONNECT.
    pub(crate) fn requires_tunnel(&self) -> bool {
        self.address.is_https() && matches!(self.proxy, Proxy::Http { .. })
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Route) -> bool {
        self.address.host() == other.address.host()
            && self.address.port() == other.address.port()
            && self.proxy == other.proxy
            && self.socket_addr == other.socket_addr
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.host().hash(state);
        self.address.port().hash(state);
        self.proxy.hash(state);
        self.socket_addr.hash(state);
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} via {:?} at {}",
            self.address.host(),
            self.address.port(),
            self.proxy,
            self.socket_addr
        )
    }
}
