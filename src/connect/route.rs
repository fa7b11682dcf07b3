//! Route planning.
//!
//! Turns an [`Address`] into a lazy, finite sequence of [`Route`]s: one
//! batch per proxy, one route per resolved socket address. Routes that
//! failed recently are deferred to the very end of the plan.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use http::Uri;
use tracing::{debug, trace};

use super::{Address, Proxy, Route};
use crate::error::Error;

/// Shared memory of routes that have failed.
///
/// A failed route is not retried until every untried route has been
/// attempted; a successful connect clears the grudge.
#[derive(Debug, Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    pub(crate) fn new() -> RouteDatabase {
        RouteDatabase::default()
    }

    pub(crate) fn failed(&self, route: &Route) {
        debug!("route failed: {:?}", route);
        self.failed.lock().unwrap().insert(route.clone());
    }

    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().unwrap().remove(route);
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().unwrap().contains(route)
    }

    #[cfg(test)]
    pub(crate) fn failed_len(&self) -> usize {
        self.failed.lock().unwrap().len()
    }
}

/// Iterates the routes for one address.
///
/// Not `Clone`: the selector is per-call state, consumed as the retry
/// interceptor walks the plan.
pub(crate) struct RouteSelector {
    address: Address,
    uri: Uri,
    db: Arc<RouteDatabase>,
    proxies: Vec<Proxy>,
    next_proxy: usize,
    started: bool,
    /// Failed-before routes, deferred until everything fresh was tried.
    postponed: Vec<Route>,
    /// DNS failures collected along the way, surfaced on exhaustion.
    deferred_errors: Vec<Error>,
}

impl RouteSelector {
    pub(crate) fn new(address: Address, uri: Uri, db: Arc<RouteDatabase>) -> RouteSelector {
        RouteSelector {
            address,
            uri,
            db,
            proxies: Vec::new(),
            next_proxy: 0,
            started: false,
            postponed: Vec::new(),
            deferred_errors: Vec::new(),
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        !self.started || self.next_proxy < self.proxies.len() || !self.postponed.is_empty()
    }

    /// Returns the next batch of fresh routes, or the postponed batch once
    /// fresh routes run out, or an exhaustion error carrying every failure
    /// seen while planning.
    pub(crate) async fn next(&mut self) -> Result<Vec<Route>, Error> {
        if !self.started {
            self.started = true;
            self.proxies = match self.address.proxy() {
                Some(proxy) => vec![proxy.clone()],
                None => {
                    let selected = self.address.proxy_selector().select(&self.uri);
                    if selected.is_empty() {
                        vec![Proxy::Direct]
                    } else {
                        selected
                    }
                }
            };
            trace!("route plan for {:?}: proxies={:?}", self.address, self.proxies);
        }

        while self.next_proxy < self.proxies.len() {
            let proxy = self.proxies[self.next_proxy].clone();
            self.next_proxy += 1;

            let routes = match self.resolve(&proxy).await {
                Ok(routes) => routes,
                Err(err) => {
                    // DNS failure kills this proxy, not the plan.
                    self.address.proxy_selector().connect_failed(&self.uri, &proxy);
                    self.deferred_errors.push(err);
                    continue;
                }
            };

            let mut fresh = Vec::with_capacity(routes.len());
            for route in routes {
                if self.db.should_postpone(&route) {
                    self.postponed.push(route);
                } else {
                    fresh.push(route);
                }
            }
            if !fresh.is_empty() {
                return Ok(fresh);
            }
        }

        if !self.postponed.is_empty() {
            return Ok(std::mem::take(&mut self.postponed));
        }

        Err(Error::new_routes_exhausted(std::mem::take(
            &mut self.deferred_errors,
        )))
    }

    /// Resolves the socket addresses for one proxy choice.
    ///
    /// DIRECT and SOCKS routes resolve the host they dial; an HTTP CONNECT
    /// proxy is dialed by its own name while the origin hostname is kept
    /// for SNI inside the tunnel.
    async fn resolve(&self, proxy: &Proxy) -> Result<Vec<Route>, Error> {
        let host = proxy.dial_host(self.address.host());
        let port = proxy.dial_port(self.address.port());

        let addrs: Vec<IpAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![ip]
        } else {
            self.address
                .dns()
                .lookup(host)
                .await
                .map_err(Error::new_connect)?
        };

        Ok(addrs
            .into_iter()
            .map(|ip| Route::new(self.address.clone(), proxy.clone(), SocketAddr::new(ip, port)))
            .collect())
    }
}
