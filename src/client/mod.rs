//! The HTTP client and its configuration.

pub(crate) mod bridge;
pub(crate) mod cache;
pub mod call;
pub mod chain;
pub(crate) mod network;
pub(crate) mod retry;

pub use self::call::Call;
pub use self::chain::{Chain, Interceptor};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use crate::conn::connect::ConnectSettings;
use crate::conn::pool::{Pool, PoolConfig, WarmPolicy};
use crate::connect::{Address, Dns, GaiResolver, NoProxy, Protocol, Proxy, ProxySelector};
use crate::error::{Error, Result};
use crate::proto::h2::{ReleaseOnConsume, ReleaseOnReceive, WindowStrategy};
use crate::request::Request;
use crate::response::Response;
use crate::runner::TaskRunner;
use crate::tls::TlsConfig;

/// Responds to authentication challenges.
///
/// Consulted for `401` by the server authenticator and for `407` by the
/// proxy authenticator (including CONNECT tunnels). Returning `None`
/// gives up and surfaces the challenge response to the caller.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, route: &crate::connect::Route, response: &Response)
        -> Option<Request>;
}

/// The default authenticator: never answers a challenge.
#[derive(Clone, Debug, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate(
        &self,
        _route: &crate::connect::Route,
        _response: &Response,
    ) -> Option<Request> {
        None
    }
}

/// A cookie jar capability. The client ships no storage; the default
/// keeps nothing.
pub trait CookieStore: Send + Sync {
    /// Returns the `Cookie` header value for a request, if any.
    fn load(&self, uri: &Uri) -> Option<String>;

    /// Offers `Set-Cookie` values from a response for storage.
    fn save(&self, uri: &Uri, set_cookie: Vec<String>);
}

#[derive(Clone, Debug, Default)]
pub struct NoCookies;

impl CookieStore for NoCookies {
    fn load(&self, _uri: &Uri) -> Option<String> {
        None
    }

    fn save(&self, _uri: &Uri, _set_cookie: Vec<String>) {}
}

/// When received HTTP/2 bytes are handed back to the peer's flow-control
/// window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowRelease {
    /// Count bytes when the application consumes them. Total buffered
    /// memory stays within the window. The default.
    OnConsume,
    /// Release the shared connection window as frames arrive, so one slow
    /// stream cannot stall the rest; per-stream windows still release on
    /// consumption. May buffer up to a window per open stream.
    OnReceive,
}

/// A response cache capability, consulted around the network.
pub trait Cache: Send + Sync {
    /// A stored response for this request, if fresh enough to serve.
    fn get(&self, request: &Request) -> Option<Response>;

    /// Offers a network response's metadata for storage.
    fn put(&self, response: &Response);
}

/// An asynchronous HTTP client.
///
/// Cheap to clone: clones share the connection pool, the task runner, and
/// every configured capability.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

pub(crate) struct ClientRef {
    pub(crate) dns: Arc<dyn Dns>,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) proxy_selector: Arc<dyn ProxySelector>,
    pub(crate) proxy_authenticator: Arc<dyn Authenticator>,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) cookie_store: Arc<dyn CookieStore>,
    pub(crate) cache: Option<Arc<dyn Cache>>,
    pub(crate) follow_redirects: bool,
    pub(crate) follow_ssl_redirects: bool,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) user_agent: String,
    pub(crate) protocols: Vec<Protocol>,
    pub(crate) application_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) runner: TaskRunner,
    pub(crate) pool: Pool,
}

impl Client {
    /// A client with the default configuration.
    pub fn new() -> Client {
        Client::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Prepares a call. Nothing happens until the call is executed or
    /// enqueued.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    /// Convenience for `new_call(request).execute()`.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.new_call(request).execute().await
    }

    /// Opens a WebSocket. See [`crate::ws`].
    pub async fn websocket(
        &self,
        request: Request,
        listener: Arc<dyn crate::ws::Listener>,
    ) -> Result<crate::ws::WebSocket> {
        crate::ws::connect(self.clone(), request, listener).await
    }

    /// The number of currently idle pooled connections.
    pub fn idle_connection_count(&self) -> usize {
        self.inner.pool.idle_count()
    }

    /// The number of pooled connections, idle or busy.
    pub fn connection_count(&self) -> usize {
        self.inner.pool.connection_count()
    }

    /// Requires at least `minimum` ready connections for `uri`'s address,
    /// dialed and kept warm in the background.
    pub fn require_warm_connections(&self, uri: &Uri, minimum: usize) -> Result<()> {
        let address = self.address_for(uri)?;
        self.inner.pool.set_warm_policy(WarmPolicy {
            address,
            uri: uri.clone(),
            minimum,
        });
        Ok(())
    }

    pub(crate) fn conf(&self) -> &ClientRef {
        &self.inner
    }

    /// The connection-reuse tuple for a request URI.
    pub(crate) fn address_for(&self, uri: &Uri) -> Result<Address> {
        let host = uri
            .host()
            .ok_or_else(Error::new_user_absolute_uri_required)?
            .trim_matches(|c| c == '[' || c == ']')
            .to_ascii_lowercase();
        let (tls, default_port) = match uri.scheme_str() {
            Some("http") => (None, 80),
            Some("https") => {
                let tls = self.inner.tls.clone().ok_or_else(|| {
                    Error::new_user_unsupported_scheme()
                        .with("https requested but no TLS connector configured")
                })?;
                (Some(tls), 443)
            }
            _ => return Err(Error::new_user_unsupported_scheme()),
        };
        let port = uri.port_u16().unwrap_or(default_port);
        Ok(Address::new(
            host,
            port,
            self.inner.dns.clone(),
            tls,
            self.inner.proxy.clone(),
            self.inner.proxy_selector.clone(),
            self.inner.proxy_authenticator.clone(),
            self.inner.protocols.clone(),
        ))
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("follow_redirects", &self.inner.follow_redirects)
            .field("protocols", &self.inner.protocols)
            .finish()
    }
}

/// Configures a [`Client`].
pub struct ClientBuilder {
    dns: Arc<dyn Dns>,
    tls: Option<TlsConfig>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    proxy_authenticator: Arc<dyn Authenticator>,
    authenticator: Arc<dyn Authenticator>,
    cookie_store: Arc<dyn CookieStore>,
    cache: Option<Arc<dyn Cache>>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    call_timeout: Option<Duration>,
    ping_interval: Option<Duration>,
    user_agent: String,
    protocols: Vec<Protocol>,
    pool_config: PoolConfig,
    window_strategy: Arc<dyn WindowStrategy>,
    application_interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    runner: Option<TaskRunner>,
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            dns: Arc::new(GaiResolver::new()),
            tls: None,
            proxy: None,
            proxy_selector: Arc::new(NoProxy),
            proxy_authenticator: Arc::new(NoAuth),
            authenticator: Arc::new(NoAuth),
            cookie_store: Arc::new(NoCookies),
            cache: None,
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            call_timeout: None,
            ping_interval: None,
            user_agent: concat!("squall/", env!("CARGO_PKG_VERSION")).to_owned(),
            protocols: vec![Protocol::Http2, Protocol::Http1],
            pool_config: PoolConfig::default(),
            window_strategy: Arc::new(ReleaseOnConsume),
            application_interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            runner: None,
        }
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> ClientBuilder {
        self.dns = dns;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> ClientBuilder {
        self.tls = Some(tls);
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.proxy = Some(proxy);
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> ClientBuilder {
        self.proxy_selector = selector;
        self
    }

    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> ClientBuilder {
        self.proxy_authenticator = authenticator;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> ClientBuilder {
        self.authenticator = authenticator;
        self
    }

    pub fn cookie_store(mut self, store: Arc<dyn CookieStore>) -> ClientBuilder {
        self.cookie_store = store;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache>) -> ClientBuilder {
        self.cache = Some(cache);
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> ClientBuilder {
        self.follow_redirects = follow;
        self
    }

    /// Whether redirects may cross between `https` and `http`.
    pub fn follow_ssl_redirects(mut self, follow: bool) -> ClientBuilder {
        self.follow_ssl_redirects = follow;
        self
    }

    pub fn retry_on_connection_failure(mut self, retry: bool) -> ClientBuilder {
        self.retry_on_connection_failure = retry;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.write_timeout = timeout;
        self
    }

    /// A deadline over the whole call: connect, send, follow-ups, and
    /// reading the response head.
    pub fn call_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.call_timeout = timeout;
        self
    }

    /// Enables HTTP/2 and WebSocket ping watchdogs.
    pub fn ping_interval(mut self, interval: Option<Duration>) -> ClientBuilder {
        self.ping_interval = interval;
        self
    }

    /// Picks the HTTP/2 receive-window release strategy.
    pub fn http2_window_release(mut self, release: WindowRelease) -> ClientBuilder {
        self.window_strategy = match release {
            WindowRelease::OnConsume => Arc::new(ReleaseOnConsume),
            WindowRelease::OnReceive => Arc::new(ReleaseOnReceive),
        };
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> ClientBuilder {
        self.user_agent = user_agent.into();
        self
    }

    /// ALPN preference order. `[Http2]` alone means cleartext prior
    /// knowledge for `http:` targets.
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> ClientBuilder {
        self.protocols = protocols;
        self
    }

    pub fn max_idle_connections(mut self, max: usize) -> ClientBuilder {
        self.pool_config.max_idle_connections = max;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> ClientBuilder {
        self.pool_config.keep_alive = keep_alive;
        self
    }

    /// Applies to the whole chain, before retries and the network.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> ClientBuilder {
        self.application_interceptors.push(interceptor);
        self
    }

    /// Applies once per network request, on an established exchange.
    pub fn network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> ClientBuilder {
        self.network_interceptors.push(interceptor);
        self
    }

    pub fn task_runner(mut self, runner: TaskRunner) -> ClientBuilder {
        self.runner = Some(runner);
        self
    }

    pub fn build(self) -> Client {
        let runner = self.runner.unwrap_or_default();
        let settings = Arc::new(ConnectSettings {
            connect_timeout: self.connect_timeout,
            ping_interval: self.ping_interval,
            strategy: self.window_strategy.clone(),
            runner: runner.clone(),
        });
        let pool = Pool::new(self.pool_config.clone(), &runner, settings);
        Client {
            inner: Arc::new(ClientRef {
                dns: self.dns,
                tls: self.tls,
                proxy: self.proxy,
                proxy_selector: self.proxy_selector,
                proxy_authenticator: self.proxy_authenticator,
                authenticator: self.authenticator,
                cookie_store: self.cookie_store,
                cache: self.cache,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                retry_on_connection_failure: self.retry_on_connection_failure,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                call_timeout: self.call_timeout,
                ping_interval: self.ping_interval,
                user_agent: self.user_agent,
                protocols: self.protocols,
                application_interceptors: self.application_interceptors,
                network_interceptors: self.network_interceptors,
                runner,
                pool,
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("protocols", &self.protocols)
            .finish()
    }
}
