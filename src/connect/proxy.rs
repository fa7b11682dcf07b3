//! Proxies and proxy selection.

use std::fmt;

use http::Uri;

/// How to reach the origin server: directly, through an HTTP proxy
/// (CONNECT-tunneled for `https:`), or through a SOCKS proxy.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    Http { host: String, port: u16 },
    Socks { host: String, port: u16 },
}

impl Proxy {
    pub fn http(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Http {
            host: host.into(),
            port,
        }
    }

    pub fn socks(host: impl Into<String>, port: u16) -> Proxy {
        Proxy::Socks {
            host: host.into(),
            port,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }

    /// The host the connection is dialed to: the proxy's for proxied
    /// routes, which is why proxied routes DNS-resolve the proxy host.
    pub(crate) fn dial_host<'a>(&'a self, origin_host: &'a str) -> &'a str {
        match self {
            Proxy::Direct => origin_host,
            Proxy::Http { host, .. } | Proxy::Socks { host, .. } => host,
        }
    }

    pub(crate) fn dial_port(&self, origin_port: u16) -> u16 {
        match self {
            Proxy::Direct => origin_port,
            Proxy::Http { port, .. } | Proxy::Socks { port, .. } => *port,
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("Direct"),
            Proxy::Http { host, port } => write!(f, "Http({}:{})", host, port),
            Proxy::Socks { host, port } => write!(f, "Socks({}:{})", host, port),
        }
    }
}

/// Chooses proxies for a URI, in preference order.
///
/// An empty result is treated as [`Proxy::Direct`]; a selector cannot make
/// a URI unreachable, only reroute it.
pub trait ProxySelector: Send + Sync {
    fn select(&self, uri: &Uri) -> Vec<Proxy>;

    /// Invoked when connecting through a selected proxy failed, so
    /// stateful selectors can de-prioritize it.
    fn connect_failed(&self, _uri: &Uri, _proxy: &Proxy) {}
}

/// The default selector: everything connects directly.
#[derive(Clone, Debug, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _uri: &Uri) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}
