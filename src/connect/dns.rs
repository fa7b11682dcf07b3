//! DNS capability.

use std::future::Future;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::pin::Pin;

/// The future returned by a [`Dns`] lookup.
pub type Resolving = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send>>;

/// Resolves hostnames to IP addresses, in preference order.
///
/// The returned list must be non-empty on success; the route planner emits
/// one route per address.
pub trait Dns: Send + Sync {
    fn lookup(&self, host: &str) -> Resolving;
}

/// The default resolver: blocking `getaddrinfo` on the runtime's blocking
/// pool.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    pub fn new() -> GaiResolver {
        GaiResolver { _priv: () }
    }
}

impl Dns for GaiResolver {
    fn lookup(&self, host: &str) -> Resolving {
        let host = host.to_owned();
        Box::pin(async move {
            let addrs = tokio::task::spawn_blocking(move || {
                // Port is irrelevant here; `ToSocketAddrs` requires one.
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.map(|sa| sa.ip()).collect::<Vec<_>>())
            })
            .await
            .map_err(|join| io::Error::new(io::ErrorKind::Other, join))??;

            if addrs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "dns lookup returned no addresses",
                ));
            }
            Ok(addrs)
        })
    }
}

/// A resolver with canned answers, for tests and static configurations.
#[derive(Clone, Debug, Default)]
pub struct StaticDns {
    entries: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticDns {
    pub fn new() -> StaticDns {
        StaticDns {
            entries: Default::default(),
        }
    }

    pub fn insert(mut self, host: &str, addrs: Vec<IpAddr>) -> StaticDns {
        self.entries.insert(host.to_owned(), addrs);
        self
    }
}

impl Dns for StaticDns {
    fn lookup(&self, host: &str) -> Resolving {
        let result = match self.entries.get(host) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no static entry for {:?}", host),
            )),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_dns_answers() {
        let dns = StaticDns::new().insert("a.example.test", vec!["127.0.0.1".parse().unwrap()]);
        let addrs = dns.lookup("a.example.test").await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        assert!(dns.lookup("b.example.test").await.is_err());
    }

    #[tokio::test]
    async fn gai_resolves_localhost() {
        let dns = GaiResolver::new();
        let addrs = dns.lookup("localhost").await.unwrap();
        assert!(!addrs.is_empty());
    }
}
