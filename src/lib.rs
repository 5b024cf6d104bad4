#![cfg_attr(docsrs, feature(doc_cfg))]

//! # courier
//!
//! An asynchronous HTTP client speaking HTTP/1.0, HTTP/1.1 and HTTP/2
//! (with ALPN negotiation over TLS and prior-knowledge cleartext h2),
//! pooling transport connections per endpoint and multiplexing concurrent
//! requests onto a single HTTP/2 connection.
//!
//! ## Example
//!
//! ```no_run
//! use courier::{HttpClient, HttpRequest};
//!
//! # async fn run() -> courier::Result<()> {
//! let client = HttpClient::of_default();
//! let request = HttpRequest::get("http://example.com/").build()?;
//! let response = client.execute(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```
//!
//! Requests come in four shapes, each with its own wire form: plain
//! (headers plus an optional in-memory body), file (streamed from disk),
//! multipart (RFC 7578, or form-urlencoded), and chunk (the caller streams
//! the body through a [`ChunkWriter`] after dispatch).
//!
//! The execution pipeline is extensible: interceptors wrap the whole
//! exchange (the built-ins provide retries, redirect following, filter
//! dispatch and expect-continue handling), request/response filters hook
//! the edges, and a [`Listener`] observes one request's lifecycle events.

mod builder;
mod client;
mod config;
mod context;
mod error;
mod exec;
mod filter;
mod listener;
mod proto;
mod request;
mod resolver;
mod response;

pub use crate::builder::ClientBuilder;
pub use crate::client::{HttpClient, ResponseFuture};
pub use crate::config::{
    ChannelPoolOptions, ChannelPoolOptionsProvider, Decompression, Http1Options, Http2Options,
    HttpVersion, NetOptions, RetryOptions, Scheme, SslOptions,
};
pub use crate::context::{ChunkWriterFuture, Context};
pub use crate::error::{Error, Result};
pub use crate::exec::{Interceptor, Next};
pub use crate::filter::{DuplexFilter, FilterContext, RequestFilter, ResponseFilter};
pub use crate::listener::{Listener, NoopListener};
pub use crate::proto::ChunkWriter;
pub use crate::request::{HttpRequest, MultipartRequestBuilder, RequestBuilder, RequestType};
pub use crate::resolver::{HostResolver, SystemResolver};
pub use crate::response::HttpResponse;

/// Stops the process-wide read-timeout timer, cancelling every outstanding
/// token.
///
/// Call once when the process is done with all clients; requests issued
/// afterwards run without read timeouts armed.
pub fn shutdown_timer() {
    for token in crate::proto::timer::global().stop() {
        token.cancel();
    }
}
