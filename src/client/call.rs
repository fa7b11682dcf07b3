//! Calls: one request and its eventual response.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::client::chain::{Chain, Interceptor};
use crate::client::{bridge, cache, network, retry, Client};
use crate::conn::exchange::Exchange;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::runner::task_fn;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// A request that is ready to be executed, at most once.
///
/// Obtain a [`CancelHandle`] before executing to cancel from elsewhere.
pub struct Call {
    client: Client,
    request: Option<Request>,
    ctx: Arc<CallContext>,
}

/// Cancels a call from any task. Idempotent, racy by design: whichever
/// await the call is parked on returns a cancellation error.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    canceled: AtomicBool,
    timed_out: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub(crate) fn new() -> CancelHandle {
        CancelHandle {
            inner: Arc::new(CancelInner {
                canceled: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn cancel_for_timeout(&self) {
        self.inner.timed_out.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    /// Resolves when the call is canceled; never resolves otherwise.
    pub(crate) async fn canceled(&self) {
        while !self.is_canceled() {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Per-call state shared down the interceptor chain.
pub(crate) struct CallContext {
    pub(crate) client: Client,
    pub(crate) call_id: u64,
    pub(crate) cancel: CancelHandle,
    /// The route/connection finder, kept across retries so the route
    /// database's failure memory advances through the plan.
    pub(crate) finder: tokio::sync::Mutex<Option<network::ExchangeFinder>>,
    /// Hand-off slot between the connect and call-server interceptors.
    pub(crate) exchange: Mutex<Option<Exchange>>,
    /// Set once request transmission began; gates timeout recovery.
    pub(crate) request_started: AtomicBool,
}

impl CallContext {
    pub(crate) async fn has_more_routes(&self) -> bool {
        match self.finder.lock().await.as_ref() {
            Some(finder) => finder.has_more_routes(),
            None => true,
        }
    }
}

impl Call {
    pub(crate) fn new(client: Client, request: Request) -> Call {
        let ctx = Arc::new(CallContext {
            client: client.clone(),
            call_id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            cancel: CancelHandle::new(),
            finder: tokio::sync::Mutex::new(None),
            exchange: Mutex::new(None),
            request_started: AtomicBool::new(false),
        });
        Call {
            client,
            request: Some(request),
            ctx,
        }
    }

    /// A handle that cancels this call from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.ctx.cancel.clone()
    }

    pub fn cancel(&self) {
        self.ctx.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.ctx.cancel.is_canceled()
    }

    /// Runs the call to completion.
    pub async fn execute(mut self) -> Result<Response> {
        let request = self
            .request
            .take()
            .ok_or_else(Error::new_user_already_executed)?;

        // The call timeout is a timer that cancels the call; the result
        // is then reported as a timeout rather than a bare cancellation.
        let timeout_queue = self.client.conf().call_timeout.map(|timeout| {
            let queue = self.client.conf().runner.new_queue("call timeout");
            let cancel = self.ctx.cancel.clone();
            queue.schedule(
                task_fn("call timeout", move || {
                    debug!("call timeout fired");
                    cancel.cancel_for_timeout();
                    None
                }),
                timeout,
            );
            queue
        });

        let interceptors = assemble_interceptors(&self.client);
        let mut chain = Chain::new(&self.ctx, &interceptors, request);
        let request = chain.take_request();
        let result = chain.proceed(request).await;

        if let Some(queue) = timeout_queue {
            queue.shutdown();
        }

        match result {
            Err(err) if self.ctx.cancel.is_timed_out() && err.is_canceled() => {
                Err(Error::new_timeout())
            }
            other => other,
        }
    }

    /// Executes on the runtime, delivering the outcome to `callback`
    /// exactly once.
    pub fn enqueue<F>(self, callback: F)
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        tokio::spawn(async move {
            let result = self.execute().await;
            callback(result);
        });
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.ctx.call_id)
            .field("executed", &self.request.is_none())
            .finish()
    }
}

/// Outermost first: user application interceptors, then the built-in
/// stack, then user network interceptors, then the wire.
fn assemble_interceptors(client: &Client) -> Vec<Arc<dyn Interceptor>> {
    let conf = client.conf();
    let mut interceptors: Vec<Arc<dyn Interceptor>> =
        Vec::with_capacity(conf.application_interceptors.len() + conf.network_interceptors.len() + 5);
    interceptors.extend(conf.application_interceptors.iter().cloned());
    interceptors.push(Arc::new(retry::RetryAndFollowUp::new()));
    interceptors.push(Arc::new(bridge::Bridge::new()));
    interceptors.push(Arc::new(cache::CacheInterceptor::new()));
    interceptors.push(Arc::new(network::Connect::new()));
    interceptors.extend(conf.network_interceptors.iter().cloned());
    interceptors.push(Arc::new(network::CallServer::new()));
    interceptors
}
