//! The network end of the chain: finding a connection and speaking HTTP.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::client::chain::{BoxFuture, Chain, Interceptor};
use crate::conn::connect::connect;
use crate::conn::exchange::{Exchange, ExchangeConn};
use crate::conn::{Borrowed, Connection, Pool};
use crate::connect::{Address, Route, RouteSelector};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

/// Locates or establishes a connection for one call's address, walking
/// the route plan as attempts fail. Lives in the call context so retries
/// continue the plan instead of restarting it.
pub(crate) struct ExchangeFinder {
    pool: Pool,
    address: Address,
    selector: RouteSelector,
    /// The most recent batch from the selector, also used to widen
    /// coalescing checks with resolved addresses.
    routes: Vec<Route>,
    next_route: usize,
}

impl ExchangeFinder {
    pub(crate) fn new(pool: Pool, address: Address, uri: http::Uri) -> ExchangeFinder {
        let selector = RouteSelector::new(address.clone(), uri, pool.route_db().clone());
        ExchangeFinder {
            pool,
            address,
            selector,
            routes: Vec::new(),
            next_route: 0,
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn has_more_routes(&self) -> bool {
        self.next_route < self.routes.len() || self.selector.has_next()
    }

    /// A healthy pooled or fresh connection, borrowed for this call.
    pub(crate) async fn find(
        &mut self,
        call_id: u64,
        extensive_health_check: bool,
    ) -> Result<(Arc<Connection>, Borrowed)> {
        // First look for a pooled connection on what we already know.
        let resolved = if self.routes.is_empty() {
            None
        } else {
            Some(&self.routes[..])
        };
        if let Some(hit) =
            self.pool
                .acquire(&self.address, resolved, false, extensive_health_check, call_id)
        {
            return Ok(hit);
        }

        let mut suppressed: Vec<Error> = Vec::new();
        loop {
            let route = match self.next_route().await {
                Ok(route) => route,
                Err(mut err) => {
                    for earlier in suppressed {
                        err.push_suppressed(earlier);
                    }
                    return Err(err);
                }
            };

            // A batch of freshly resolved routes may reveal a pooled
            // HTTP/2 connection whose peer address now matches.
            if let Some(hit) = self.pool.acquire(
                &self.address,
                Some(&self.routes[..]),
                false,
                extensive_health_check,
                call_id,
            ) {
                return Ok(hit);
            }

            trace!("attempting route {:?}", route);
            match connect(&route, self.pool.settings().as_ref()).await {
                Ok(conn) => {
                    self.pool.route_db().connected(&route);
                    let (conn, borrowed) =
                        self.pool
                            .insert_or_coalesce(Arc::new(conn), &self.address, call_id);
                    return Ok((conn, borrowed));
                }
                Err(err) => {
                    debug!("route {:?} failed: {}", route, err);
                    self.pool.route_db().failed(&route);
                    suppressed.push(err);
                }
            }
        }
    }

    async fn next_route(&mut self) -> Result<Route> {
        if self.next_route >= self.routes.len() {
            self.routes = self.selector.next().await?;
            self.next_route = 0;
        }
        let route = self.routes[self.next_route].clone();
        self.next_route += 1;
        Ok(route)
    }
}

/// Opens the exchange: borrows a connection and parks the exchange for
/// the terminal interceptor.
pub(crate) struct Connect;

impl Connect {
    pub(crate) fn new() -> Connect {
        Connect
    }
}

impl Interceptor for Connect {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.context().clone();
            if ctx.cancel.is_canceled() {
                return Err(Error::new_canceled());
            }

            let address = ctx.client.address_for(chain.request().uri())?;
            let extensive = !chain.request().body().is_empty();

            let (conn, borrowed) = {
                let mut finder_slot = ctx.finder.lock().await;
                let recreate = match finder_slot.as_ref() {
                    Some(finder) => !finder.address().equivalent(&address),
                    None => true,
                };
                if recreate {
                    *finder_slot = Some(ExchangeFinder::new(
                        ctx.client.conf().pool.clone(),
                        address,
                        chain.request().uri().clone(),
                    ));
                }
                let finder = finder_slot.as_mut().expect("finder just ensured");
                finder.find(ctx.call_id, extensive).await?
            };

            let exchange = Exchange::new(
                ctx.client.conf().pool.clone(),
                conn,
                borrowed,
                ctx.call_id,
                ctx.cancel.clone(),
                ctx.client.conf().read_timeout,
                ctx.client.conf().write_timeout,
            );
            *ctx.exchange.lock().unwrap() = Some(exchange);

            let mut chain = chain;
            let request = chain.take_request();
            let result = chain.proceed(request).await;
            if result.is_err() {
                // The exchange never reached the wire layer, or died
                // there; make sure the borrow is returned.
                drop(ctx.exchange.lock().unwrap().take());
            }
            result
        })
    }
}

/// The terminal interceptor: writes the request, reads the response.
pub(crate) struct CallServer;

impl CallServer {
    pub(crate) fn new() -> CallServer {
        CallServer
    }
}

impl Interceptor for CallServer {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.context().clone();
            let mut exchange = ctx
                .exchange
                .lock()
                .unwrap()
                .take()
                .expect("connect interceptor opens the exchange");

            let mut chain = chain;
            let mut request = chain.take_request();
            let method = request.method().clone();
            let uri = request.uri().clone();

            ctx.request_started.store(true, Ordering::SeqCst);
            exchange.send_request(&mut request).await?;
            let head = exchange.read_response_head().await?;

            let sent_at = exchange.sent_at();
            let received_at = exchange.received_at();
            let conn = exchange.connection().clone();
            let handshake = conn.handshake().cloned();

            let (body, on_upgrade) = exchange.into_body(&method, &head)?;

            let mut response = Response::new(
                head.status,
                head.version,
                head.headers,
                body,
                uri,
                method,
                handshake,
                sent_at,
                received_at,
            );
            response.extensions_mut().insert(ExchangeConn(conn));
            response.extensions_mut().insert(on_upgrade);
            Ok(response)
        })
    }
}
