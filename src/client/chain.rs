//! The interceptor chain.
//!
//! A call is processed by a stack of interceptors, outermost first:
//! application interceptors, retry-and-follow-up, the bridge, the cache,
//! connect, network interceptors, and finally the terminal call-server
//! interceptor that talks to the wire. Each interceptor sees a [`Chain`]
//! positioned after itself and decides whether (and with what request) to
//! proceed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::client::call::CallContext;
use crate::error::Result;
use crate::request::Request;
use crate::response::Response;

/// The boxed future interceptors return.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Observes and transforms calls.
///
/// An interceptor may short-circuit (return a response without calling
/// [`Chain::proceed`]), rewrite the request, retry by proceeding more than
/// once, or decorate the response on the way out.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>>;
}

/// A position in the interceptor stack, carrying the request so far.
pub struct Chain<'a> {
    ctx: &'a Arc<CallContext>,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        ctx: &'a Arc<CallContext>,
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
    ) -> Chain<'a> {
        Chain {
            ctx,
            interceptors,
            index: 0,
            request,
        }
    }

    /// The request as it stands at this position.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Takes the request out, e.g. to modify it before proceeding.
    pub fn take_request(&mut self) -> Request {
        std::mem::replace(&mut self.request, placeholder_request())
    }

    /// True once the call has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.ctx.cancel.is_canceled()
    }

    pub(crate) fn context(&self) -> &'a Arc<CallContext> {
        self.ctx
    }

    /// Invokes the next interceptor with `request`.
    ///
    /// May be called more than once; the retry interceptor leans on that.
    pub fn proceed(&self, request: Request) -> BoxFuture<'a, Result<Response>> {
        let interceptor = &self.interceptors[self.index];
        let next = Chain {
            ctx: self.ctx,
            interceptors: self.interceptors,
            index: self.index + 1,
            request,
        };
        interceptor.intercept(next)
    }
}

impl std::fmt::Debug for Chain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("request", &self.request)
            .finish()
    }
}

fn placeholder_request() -> Request {
    Request::get("http://invalid.invalid/")
        .build()
        .expect("placeholder is a valid absolute uri")
}
