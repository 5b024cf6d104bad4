//! Request and response filters.
//!
//! Filters run inside the built-in `Filtering` interceptor slot: request
//! filters before the request reaches the transceiver, response filters
//! after the response future resolves. A [`DuplexFilter`] takes part in
//! both phases.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::Result;

/// A filter view of the per-request [`Context`].
#[derive(Clone)]
pub struct FilterContext {
    ctx: Arc<Context>,
}

impl FilterContext {
    pub(crate) fn new(ctx: Arc<Context>) -> FilterContext {
        FilterContext { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

/// Inspects or mutates a request before it is transmitted.
pub trait RequestFilter: Send + Sync {
    fn do_filter<'a>(
        &'a self,
        request: &'a mut HttpRequest,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Inspects or mutates a response before it is handed to the caller.
pub trait ResponseFilter: Send + Sync {
    fn do_filter<'a>(
        &'a self,
        response: &'a mut HttpResponse,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>>;
}

/// A filter participating in both directions.
pub trait DuplexFilter: Send + Sync {
    fn on_request<'a>(
        &'a self,
        request: &'a mut HttpRequest,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>>;

    fn on_response<'a>(
        &'a self,
        response: &'a mut HttpResponse,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Adapters splitting a duplex filter into its two directions.
pub(crate) struct DuplexRequestSide(pub(crate) Arc<dyn DuplexFilter>);

impl RequestFilter for DuplexRequestSide {
    fn do_filter<'a>(
        &'a self,
        request: &'a mut HttpRequest,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>> {
        self.0.on_request(request, ctx)
    }
}

pub(crate) struct DuplexResponseSide(pub(crate) Arc<dyn DuplexFilter>);

impl ResponseFilter for DuplexResponseSide {
    fn do_filter<'a>(
        &'a self,
        response: &'a mut HttpResponse,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>> {
        self.0.on_response(response, ctx)
    }
}

impl<F> RequestFilter for F
where
    F: Fn(&mut HttpRequest, &FilterContext) -> Result<()> + Send + Sync,
{
    fn do_filter<'a>(
        &'a self,
        request: &'a mut HttpRequest,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>> {
        let result = (self)(request, ctx);
        Box::pin(async move { result })
    }
}

impl<F> ResponseFilter for F
where
    F: Fn(&mut HttpResponse, &FilterContext) -> Result<()> + Send + Sync,
{
    fn do_filter<'a>(
        &'a self,
        response: &'a mut HttpResponse,
        ctx: &'a FilterContext,
    ) -> BoxFuture<'a, Result<()>> {
        let result = (self)(response, ctx);
        Box::pin(async move { result })
    }
}
