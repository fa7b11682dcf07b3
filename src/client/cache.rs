//! Consulting the cache capability.
//!
//! The client ships no cache storage. When one is configured, it is
//! asked before the network and offered every network response after.

use tracing::trace;

use crate::client::chain::{BoxFuture, Chain, Interceptor};
use crate::error::Result;
use crate::response::Response;

pub(crate) struct CacheInterceptor;

impl CacheInterceptor {
    pub(crate) fn new() -> CacheInterceptor {
        CacheInterceptor
    }
}

impl Interceptor for CacheInterceptor {
    fn intercept<'a>(&'a self, chain: Chain<'a>) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let ctx = chain.context().clone();
            let cache = ctx.client.conf().cache.clone();

            if let Some(cache) = &cache {
                if let Some(hit) = cache.get(chain.request()) {
                    trace!("cache hit for {}", chain.request().uri());
                    return Ok(hit);
                }
            }

            let mut chain = chain;
            let request = chain.take_request();
            let response = chain.proceed(request).await?;

            if let Some(cache) = &cache {
                cache.put(&response);
            }
            Ok(response)
        })
    }
}
