//! The connection pool.
//!
//! Owns every connection exclusively. Exchanges borrow connections via
//! [`Pool::acquire`]; release decides between re-pooling and closing.
//! A cleanup task on the runner evicts idle connections past their
//! keep-alive and enforces the idle ceiling; warm-pool policies keep a
//! minimum of ready connections per address.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use http::Uri;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::connect::{connect, ConnectSettings};
use super::{Borrowed, Connection};
use crate::connect::{Address, Route, RouteDatabase, RouteSelector};
use crate::runner::{task_fn, TaskQueue, TaskRunner};

#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) max_idle_connections: usize,
    pub(crate) keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

/// A minimum number of ready connections to keep for one address.
pub(crate) struct WarmPolicy {
    pub(crate) address: Address,
    pub(crate) uri: Uri,
    pub(crate) minimum: usize,
}

#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connections: Mutex<Vec<Arc<Connection>>>,
    queue: TaskQueue,
    cleanup: Mutex<Option<Arc<dyn crate::runner::Task>>>,
    route_db: Arc<RouteDatabase>,
    settings: Arc<ConnectSettings>,
}

impl Pool {
    pub(crate) fn new(
        config: PoolConfig,
        runner: &TaskRunner,
        settings: Arc<ConnectSettings>,
    ) -> Pool {
        Pool {
            inner: Arc::new(PoolInner {
                config,
                connections: Mutex::new(Vec::new()),
                queue: runner.new_queue("connection pool"),
                cleanup: Mutex::new(None),
                route_db: Arc::new(RouteDatabase::new()),
                settings,
            }),
        }
    }

    pub(crate) fn route_db(&self) -> &Arc<RouteDatabase> {
        &self.inner.route_db
    }

    pub(crate) fn settings(&self) -> &Arc<ConnectSettings> {
        &self.inner.settings
    }

    /// Finds a pooled connection eligible for `address` and borrows it.
    ///
    /// `routes`, when the planner has resolved them, widen HTTP/2
    /// coalescing checks; `require_multiplexed` restricts the scan to
    /// HTTP/2 connections; `extensive` requests the socket-probing health
    /// check.
    pub(crate) fn acquire(
        &self,
        address: &Address,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
        extensive: bool,
        call_id: u64,
    ) -> Option<(Arc<Connection>, Borrowed)> {
        let snapshot: Vec<Arc<Connection>> =
            self.inner.connections.lock().unwrap().iter().cloned().collect();

        for conn in snapshot {
            if require_multiplexed && !conn.is_multiplexed() {
                continue;
            }
            if !conn.is_eligible(address, routes) {
                continue;
            }
            if !conn.is_healthy(extensive) {
                // Unhealthy: poison, and drop it entirely once idle.
                conn.set_no_new_exchanges();
                if conn.call_count() == 0 {
                    self.evict(&conn);
                }
                continue;
            }
            if let Some(borrowed) = conn.reserve(call_id) {
                trace!("pool hit: conn {} for {:?}", conn.id(), address);
                return Some((conn, borrowed));
            }
        }
        None
    }

    /// Inserts a freshly-connected connection, deduplicating multiplexed
    /// connections that raced for the same address.
    ///
    /// Between route planning and now, another call may have pooled an
    /// HTTP/2 connection to this address. Both sides resolve the race
    /// the same way by always preferring the connection with the smaller
    /// id, so exactly one survives.
    pub(crate) fn insert_or_coalesce(
        &self,
        fresh: Arc<Connection>,
        address: &Address,
        call_id: u64,
    ) -> (Arc<Connection>, Borrowed) {
        if fresh.is_multiplexed() {
            let existing = {
                let connections = self.inner.connections.lock().unwrap();
                connections
                    .iter()
                    .filter(|c| {
                        c.is_multiplexed() && c.id() != fresh.id() && c.is_eligible(address, None)
                    })
                    .min_by_key(|c| c.id())
                    .cloned()
            };
            if let Some(existing) = existing {
                if existing.id() < fresh.id() {
                    if let Some(borrowed) = existing.reserve(call_id) {
                        debug!(
                            "discarding racing conn {} in favor of pooled conn {}",
                            fresh.id(),
                            existing.id()
                        );
                        fresh.close();
                        return (existing, borrowed);
                    }
                }
            }
        }

        let borrowed = fresh
            .reserve(call_id)
            .expect("fresh connection must accept its first exchange");
        self.inner.connections.lock().unwrap().push(fresh.clone());
        self.schedule_cleanup(Duration::from_millis(0));
        (fresh, borrowed)
    }

    /// Drops one call's borrow. HTTP/1 connections become idle; poisoned
    /// multiplexed connections leave the pool once unreferenced.
    pub(crate) fn release(&self, conn: &Arc<Connection>, call_id: u64) {
        conn.release(call_id);
        if conn.call_count() == 0 {
            if conn.no_new_exchanges() {
                self.evict(conn);
            } else {
                // Newly idle: run a pass now; it reschedules itself for
                // the keep-alive horizon.
                self.schedule_cleanup(Duration::from_millis(0));
            }
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.idle_at().is_some())
            .count()
    }

    /// Installs a warm-pool policy: dial until `minimum` ready
    /// connections exist for the address, re-dialing with backoff as
    /// connections churn.
    pub(crate) fn set_warm_policy(&self, policy: WarmPolicy) {
        let weak = Arc::downgrade(&self.inner);
        let policy = Arc::new(policy);
        let task = {
            let policy = policy.clone();
            task_fn("warm pool", move || warm_pass(&weak, &policy))
        };
        self.inner.queue.schedule(task, Duration::from_millis(0));
    }

    fn evict(&self, conn: &Arc<Connection>) {
        let mut connections = self.inner.connections.lock().unwrap();
        if let Some(i) = connections.iter().position(|c| c.id() == conn.id()) {
            let conn = connections.remove(i);
            debug!("evicting conn {}", conn.id());
            conn.close();
        }
    }

    fn schedule_cleanup(&self, delay: Duration) {
        let task = {
            let mut slot = self.inner.cleanup.lock().unwrap();
            if slot.is_none() {
                let weak = Arc::downgrade(&self.inner);
                *slot = Some(task_fn("pool cleanup", move || cleanup_pass(&weak)));
            }
            slot.as_ref().unwrap().clone()
        };
        self.inner.queue.schedule(task, delay);
    }
}

/// One eviction pass, scheduled on the pool's queue.
///
/// Evicts the longest-idle connection once it outlives the keep-alive,
/// or whenever the idle count exceeds the ceiling; otherwise sleeps
/// until the current longest-idle connection would expire.
fn cleanup_pass(weak: &Weak<PoolInner>) -> Option<Duration> {
    let inner = weak.upgrade()?;
    let now = Instant::now();
    let keep_alive = inner.config.keep_alive;

    let (evict, idle_count, longest_idle) = {
        let connections = inner.connections.lock().unwrap();
        let mut idle_count = 0;
        let mut longest: Option<(Arc<Connection>, Duration)> = None;

        for conn in connections.iter() {
            match conn.idle_at() {
                Some(at) => {
                    idle_count += 1;
                    let idle_for = now.saturating_duration_since(at);
                    if longest.as_ref().map(|(_, d)| idle_for > *d).unwrap_or(true) {
                        longest = Some((conn.clone(), idle_for));
                    }
                }
                None => {
                    // In use. Flag borrows that look forgotten.
                    if let Some(reference) = conn.oldest_reference() {
                        let held = now.saturating_duration_since(reference.acquired_at);
                        if held > keep_alive * 2 {
                            warn!(
                                "call {} has held conn {} for {:?}; possible leaked response body",
                                reference.call_id,
                                conn.id(),
                                held
                            );
                        }
                    }
                }
            }
        }

        match longest {
            Some((conn, idle_for))
                if idle_for >= keep_alive || idle_count > inner.config.max_idle_connections =>
            {
                (Some(conn), idle_count, idle_for)
            }
            Some((_, idle_for)) => (None, idle_count, idle_for),
            None => (None, 0, Duration::ZERO),
        }
    };

    if let Some(conn) = evict {
        let mut connections = inner.connections.lock().unwrap();
        if let Some(i) = connections.iter().position(|c| c.id() == conn.id()) {
            // Re-check under the lock: a call may have claimed it.
            if connections[i].idle_at().is_some() {
                let conn = connections.remove(i);
                drop(connections);
                debug!("cleanup evicting conn {}", conn.id());
                conn.close();
            }
        }
        // Run again immediately; more may be ripe.
        return Some(Duration::from_millis(0));
    }

    if idle_count > 0 {
        return Some(keep_alive.saturating_sub(longest_idle));
    }
    if !inner.connections.lock().unwrap().is_empty() {
        return Some(keep_alive);
    }
    None
}

/// One warm-pool pass: dial if below the minimum, then come back.
fn warm_pass(weak: &Weak<PoolInner>, policy: &Arc<WarmPolicy>) -> Option<Duration> {
    let inner = weak.upgrade()?;

    let ready = inner
        .connections
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.is_eligible(&policy.address, None) || {
            // Eligibility excludes fully-allocated connections, but a
            // busy connection still counts as "ready capacity" here.
            c.route().address().equivalent(&policy.address) && !c.no_new_exchanges()
        })
        .count();

    if ready >= policy.minimum {
        return Some(inner.config.keep_alive / 2);
    }

    let pool = Pool { inner: inner.clone() };
    let policy = policy.clone();
    tokio::spawn(async move {
        let mut selector = RouteSelector::new(
            policy.address.clone(),
            policy.uri.clone(),
            pool.inner.route_db.clone(),
        );
        let routes = match selector.next().await {
            Ok(routes) => routes,
            Err(err) => {
                debug!("warm pool planning failed: {}", err);
                return;
            }
        };
        for route in routes {
            match connect(&route, pool.inner.settings.as_ref()).await {
                Ok(conn) => {
                    pool.inner.route_db.connected(&route);
                    pool.inner.connections.lock().unwrap().push(Arc::new(conn));
                    pool.schedule_cleanup(pool.inner.config.keep_alive);
                    break;
                }
                Err(err) => {
                    debug!("warm pool dial failed: {}", err);
                    pool.inner.route_db.failed(&route);
                }
            }
        }
    });

    // Backoff: check again shortly whether the dial worked out.
    Some(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Stream;
    use crate::connect::{dns::StaticDns, NoProxy, Protocol, Proxy};
    use crate::proto::h1::Http1Codec;
    use crate::proto::h2::ReleaseOnConsume;
    use tokio::net::{TcpListener, TcpStream};

    fn test_settings() -> Arc<ConnectSettings> {
        Arc::new(ConnectSettings {
            connect_timeout: Duration::from_secs(5),
            ping_interval: None,
            strategy: Arc::new(ReleaseOnConsume),
            runner: TaskRunner::new(),
        })
    }

    fn address(host: &str) -> Address {
        Address::new(
            host.to_owned(),
            80,
            Arc::new(StaticDns::new()),
            None,
            None,
            Arc::new(NoProxy),
            Arc::new(crate::client::NoAuth),
            vec![Protocol::Http1],
        )
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn h1_connection(address: &Address) -> (Arc<Connection>, TcpStream) {
        let (client, server) = tcp_pair().await;
        let route = Route::new(
            address.clone(),
            Proxy::Direct,
            client.peer_addr().unwrap(),
        );
        let conn = Connection::new_h1(route, None, Http1Codec::new(Stream::Plain(client)));
        (Arc::new(conn), server)
    }

    fn pool_with(config: PoolConfig) -> (Pool, TaskRunner) {
        let runner = TaskRunner::new();
        let pool = Pool::new(config, &runner, test_settings());
        (pool, runner)
    }

    #[tokio::test]
    async fn reuse_after_release() {
        let (pool, _runner) = pool_with(PoolConfig::default());
        let addr = address("a.example.test");
        let (conn, _server) = h1_connection(&addr).await;

        let (conn, borrowed) = pool.insert_or_coalesce(conn, &addr, 1);
        match borrowed {
            Borrowed::H1(codec) => conn.park_codec(codec),
            Borrowed::H2(_) => unreachable!(),
        }
        pool.release(&conn, 1);
        assert_eq!(pool.idle_count(), 1);

        let (again, _borrowed) = pool
            .acquire(&addr, None, false, false, 2)
            .expect("idle connection is reusable");
        assert_eq!(again.id(), conn.id());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn wrong_address_is_not_eligible() {
        let (pool, _runner) = pool_with(PoolConfig::default());
        let addr = address("a.example.test");
        let other = address("b.example.test");
        let (conn, _server) = h1_connection(&addr).await;

        let (conn, borrowed) = pool.insert_or_coalesce(conn, &addr, 1);
        match borrowed {
            Borrowed::H1(codec) => conn.park_codec(codec),
            Borrowed::H2(_) => unreachable!(),
        }
        pool.release(&conn, 1);

        // HTTP/1 connections never coalesce across hosts.
        assert!(pool.acquire(&other, None, false, false, 2).is_none());
    }

    #[tokio::test]
    async fn poisoned_connection_is_evicted_on_release() {
        let (pool, _runner) = pool_with(PoolConfig::default());
        let addr = address("a.example.test");
        let (conn, _server) = h1_connection(&addr).await;

        let (conn, borrowed) = pool.insert_or_coalesce(conn, &addr, 1);
        match borrowed {
            Borrowed::H1(mut codec) => {
                codec.close();
                conn.park_codec(codec);
            }
            Borrowed::H2(_) => unreachable!(),
        }
        conn.set_no_new_exchanges();
        pool.release(&conn, 1);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_evicts_past_keep_alive() {
        let (pool, _runner) = pool_with(PoolConfig {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(30),
        });
        let addr = address("a.example.test");
        let (conn, _server) = h1_connection(&addr).await;
        let (conn, borrowed) = pool.insert_or_coalesce(conn, &addr, 1);
        match borrowed {
            Borrowed::H1(codec) => conn.park_codec(codec),
            Borrowed::H2(_) => unreachable!(),
        }
        pool.release(&conn, 1);
        assert_eq!(pool.connection_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        // Allow the queue's driver to run the eviction pass.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn warm_policy_dials_to_the_minimum() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let (pool, _runner) = pool_with(PoolConfig::default());
        let warm_address = Address::new(
            "127.0.0.1".to_owned(),
            local.port(),
            Arc::new(StaticDns::new()),
            None,
            None,
            Arc::new(NoProxy),
            Arc::new(crate::client::NoAuth),
            vec![Protocol::Http1],
        );
        pool.set_warm_policy(WarmPolicy {
            address: warm_address,
            uri: format!("http://127.0.0.1:{}/", local.port()).parse().unwrap(),
            minimum: 1,
        });

        // One backoff interval is the promise; give it a little slack.
        for _ in 0..50 {
            if pool.connection_count() >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("warm policy never established a connection");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ceiling_is_enforced() {
        let (pool, _runner) = pool_with(PoolConfig {
            max_idle_connections: 1,
            keep_alive: Duration::from_secs(300),
        });
        let addr = address("a.example.test");
        let mut servers = Vec::new();
        for call_id in 0..3u64 {
            let (conn, server) = h1_connection(&addr).await;
            servers.push(server);
            let (conn, borrowed) = pool.insert_or_coalesce(conn, &addr, call_id);
            match borrowed {
                Borrowed::H1(codec) => conn.park_codec(codec),
                Borrowed::H2(_) => unreachable!(),
            }
            pool.release(&conn, call_id);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.idle_count() <= 1, "idle={}", pool.idle_count());
    }
}
