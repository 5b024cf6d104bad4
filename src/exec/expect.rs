//! Expect-continue interceptor.

use futures_util::future::BoxFuture;
use http::header;

use crate::exec::{Interceptor, Next};
use crate::request::{Body, HttpRequest};
use crate::response::HttpResponse;
use crate::Result;

/// Flags bodied requests for 100-continue handling.
///
/// The writer then withholds the body until the interim response (or a
/// manual invocation of the stored callback) releases it.
pub(crate) struct ExpectContinueInterceptor {
    enabled_by_default: bool,
}

impl ExpectContinueInterceptor {
    pub(crate) fn new(enabled_by_default: bool) -> ExpectContinueInterceptor {
        ExpectContinueInterceptor { enabled_by_default }
    }
}

impl Interceptor for ExpectContinueInterceptor {
    fn proceed<'a>(
        &'a self,
        request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
        let enabled = request
            .config()
            .expect_continue()
            .unwrap_or(self.enabled_by_default);
        let mut request = request;
        if enabled && has_body(&request) {
            next.context().set_expect_continue_enabled(true);
            request
                .headers_mut()
                .insert(header::EXPECT, header::HeaderValue::from_static("100-continue"));
        }
        next.proceed(request)
    }
}

fn has_body(request: &HttpRequest) -> bool {
    !matches!(request.body(), Body::None)
}
