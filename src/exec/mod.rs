//! The interceptor execution chain.
//!
//! A built client holds an ordered interceptor list ending at the
//! transceiver. Each interceptor receives the request and a [`Next`]
//! cursor; calling [`Next::proceed`] passes control down the chain, and an
//! interceptor may do so more than once (retry) or not at all.

mod expect;
mod filtering;
mod redirect;
mod retry;

pub(crate) use expect::ExpectContinueInterceptor;
pub(crate) use filtering::FilteringExec;
pub(crate) use redirect::RedirectInterceptor;
pub(crate) use retry::RetryInterceptor;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::listener::{Listener, SharedListener};
use crate::proto::transceiver::Transceiver;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::Result;

/// A link in the request execution chain.
///
/// Implementations must call `next.proceed(request)` to continue; skipping
/// it short-circuits the request.
pub trait Interceptor: Send + Sync + 'static {
    fn proceed<'a>(
        &'a self,
        request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<HttpResponse>>;
}

/// Everything the chain tail needs to reach the transceiver.
pub(crate) struct ChainCore {
    pub(crate) transceiver: Arc<Transceiver>,
    pub(crate) default_read_timeout: Duration,
}

/// Cursor over the remaining interceptors of one request execution.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pub(crate) rest: &'a [Arc<dyn Interceptor>],
    pub(crate) core: &'a ChainCore,
    pub(crate) ctx: &'a Arc<Context>,
    pub(crate) listener: &'a Arc<dyn Listener>,
}

impl<'a> Next<'a> {
    /// Passes `request` to the rest of the chain, ultimately the
    /// transceiver.
    pub fn proceed(self, request: HttpRequest) -> BoxFuture<'a, Result<HttpResponse>> {
        match self.rest.split_first() {
            Some((head, rest)) => head.proceed(request, Next { rest, ..self }),
            None => {
                let read_timeout = request
                    .config()
                    .read_timeout()
                    .unwrap_or(self.core.default_read_timeout);
                let listener = Box::new(SharedListener(Arc::clone(self.listener)));
                let fut = self.core.transceiver.handle(
                    request,
                    Arc::clone(self.ctx),
                    listener,
                    read_timeout,
                );
                Box::pin(fut)
            }
        }
    }

    /// The per-request context, shared across every attempt.
    pub fn context(&self) -> &Arc<Context> {
        self.ctx
    }
}
