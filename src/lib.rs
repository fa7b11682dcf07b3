#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # squall
//!
//! squall is a **fast** and **correct** HTTP client written in and for Rust.
//!
//! ## Features
//!
//! - HTTP/1.1 and HTTP/2, over plaintext or a pluggable TLS capability
//! - WebSockets with permessage-deflate
//! - Asynchronous design on tokio
//! - Connection pooling with HTTP/2 coalescing and warm-pool policies
//! - Retries, redirects, and auth challenges handled by an interceptor
//!   chain you can extend
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> squall::Result<()> {
//! let client = squall::Client::new();
//! let response = client
//!     .execute(squall::Request::get("http://example.test/").build()?)
//!     .await?;
//! println!("{}", response.status());
//! println!("{}", response.text().await?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Capabilities, not batteries
//!
//! DNS, TLS, cookies, caching, and authentication are consumed as
//! capability objects on the [`ClientBuilder`]. The defaults resolve with
//! the system resolver, speak no TLS, keep no cookies, and answer no
//! challenges; supply your own implementations to change that.

pub mod body;
pub mod client;
pub mod connect;
mod error;
mod proto;
mod request;
mod response;
pub mod runner;
pub mod tls;
pub mod upgrade;
pub mod ws;

mod conn;

pub use crate::body::{Body, ResponseBody};
pub use crate::client::{Call, Chain, Client, ClientBuilder, Interceptor};
pub use crate::client::{Authenticator, Cache, CookieStore};
pub use crate::connect::{Protocol, Proxy};
pub use crate::error::{Error, Result};
pub use crate::request::Request;
pub use crate::response::Response;

pub use http::{HeaderMap, Method, StatusCode, Uri, Version};
