//! Filter-running interceptor.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::exec::{Interceptor, Next};
use crate::filter::{FilterContext, RequestFilter, ResponseFilter};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::Result;

/// Runs request filters on the way down and response filters on the way
/// back up.
///
/// The builder replaces this slot with a fresh instance on every filter
/// mutation, so downstream holders of the interceptor list can detect
/// reconfiguration by identity.
pub(crate) struct FilteringExec {
    request_filters: Arc<[Arc<dyn RequestFilter>]>,
    response_filters: Arc<[Arc<dyn ResponseFilter>]>,
}

impl FilteringExec {
    pub(crate) fn new(
        request_filters: Vec<Arc<dyn RequestFilter>>,
        response_filters: Vec<Arc<dyn ResponseFilter>>,
    ) -> FilteringExec {
        FilteringExec {
            request_filters: request_filters.into(),
            response_filters: response_filters.into(),
        }
    }
}

impl Interceptor for FilteringExec {
    fn proceed<'a>(
        &'a self,
        request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            let fctx = FilterContext::new(Arc::clone(next.context()));
            let mut request = request;
            for filter in self.request_filters.iter() {
                filter.do_filter(&mut request, &fctx).await?;
            }

            let mut response = next.proceed(request).await?;
            for filter in self.response_filters.iter() {
                filter.do_filter(&mut response, &fctx).await?;
            }
            Ok(response)
        })
    }
}
