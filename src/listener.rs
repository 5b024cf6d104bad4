//! Request lifecycle observer.

use std::net::SocketAddr;

use crate::context::Context;
use crate::request::HttpRequest;
use crate::Error;

/// Observes the lifecycle of a single request as it moves through the
/// transceiver.
///
/// Callbacks for one request are totally ordered and never overlap. Every
/// request sees exactly one terminal callback: `on_completed` after the
/// response message ended, or `on_error`.
///
/// All methods have empty default bodies so implementations only override
/// what they care about.
#[allow(unused_variables)]
pub trait Listener: Send + Sync {
    /// The filter/interceptor phase has finished; transceiving begins.
    fn on_filters_end(&self, request: &HttpRequest, ctx: &Context) {}

    fn on_connection_pool_attempt(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {}

    fn on_connection_pool_acquired(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {}

    fn on_acquire_connection_pool_failed(
        &self,
        request: &HttpRequest,
        ctx: &Context,
        addr: SocketAddr,
        cause: &Error,
    ) {
    }

    fn on_connection_attempt(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {}

    fn on_connection_acquired(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {}

    fn on_acquire_connection_failed(
        &self,
        request: &HttpRequest,
        ctx: &Context,
        addr: SocketAddr,
        cause: &Error,
    ) {
    }

    fn on_write_attempt(&self, request: &HttpRequest, ctx: &Context) {}

    /// The last request byte reached the transport's outbound buffer.
    fn on_write_done(&self, request: &HttpRequest, ctx: &Context) {}

    fn on_write_failed(&self, request: &HttpRequest, ctx: &Context, cause: &Error) {}

    /// The response head arrived.
    fn on_message_received(&self, request: &HttpRequest, ctx: &Context) {}

    /// Terminal: the response message ended.
    fn on_completed(&self, request: &HttpRequest, ctx: &Context) {}

    /// Terminal: the request failed.
    fn on_error(&self, request: &HttpRequest, ctx: &Context, cause: &Error) {}
}

/// A listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl Listener for NoopListener {}

/// Delegating wrapper letting one shared listener observe every attempt of
/// a retried request.
pub(crate) struct SharedListener(pub(crate) std::sync::Arc<dyn Listener>);

impl Listener for SharedListener {
    fn on_filters_end(&self, request: &HttpRequest, ctx: &Context) {
        self.0.on_filters_end(request, ctx)
    }

    fn on_connection_pool_attempt(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {
        self.0.on_connection_pool_attempt(request, ctx, addr)
    }

    fn on_connection_pool_acquired(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {
        self.0.on_connection_pool_acquired(request, ctx, addr)
    }

    fn on_acquire_connection_pool_failed(
        &self,
        request: &HttpRequest,
        ctx: &Context,
        addr: SocketAddr,
        cause: &Error,
    ) {
        self.0
            .on_acquire_connection_pool_failed(request, ctx, addr, cause)
    }

    fn on_connection_attempt(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {
        self.0.on_connection_attempt(request, ctx, addr)
    }

    fn on_connection_acquired(&self, request: &HttpRequest, ctx: &Context, addr: SocketAddr) {
        self.0.on_connection_acquired(request, ctx, addr)
    }

    fn on_acquire_connection_failed(
        &self,
        request: &HttpRequest,
        ctx: &Context,
        addr: SocketAddr,
        cause: &Error,
    ) {
        self.0
            .on_acquire_connection_failed(request, ctx, addr, cause)
    }

    fn on_write_attempt(&self, request: &HttpRequest, ctx: &Context) {
        self.0.on_write_attempt(request, ctx)
    }

    fn on_write_done(&self, request: &HttpRequest, ctx: &Context) {
        self.0.on_write_done(request, ctx)
    }

    fn on_write_failed(&self, request: &HttpRequest, ctx: &Context, cause: &Error) {
        self.0.on_write_failed(request, ctx, cause)
    }

    fn on_message_received(&self, request: &HttpRequest, ctx: &Context) {
        self.0.on_message_received(request, ctx)
    }

    fn on_completed(&self, request: &HttpRequest, ctx: &Context) {
        self.0.on_completed(request, ctx)
    }

    fn on_error(&self, request: &HttpRequest, ctx: &Context, cause: &Error) {
        self.0.on_error(request, ctx, cause)
    }
}
