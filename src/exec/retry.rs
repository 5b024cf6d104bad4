//! Retry interceptor.

use futures_util::future::BoxFuture;
use tracing::debug;

use crate::config::RetryOptions;
use crate::exec::{Interceptor, Next};
use crate::request::{HttpRequest, RequestType};
use crate::response::HttpResponse;
use crate::Result;

/// Re-issues requests that failed before their exchange got underway.
///
/// Chunk requests are never replayed: their body is produced by the caller
/// and may already be partially streamed.
pub(crate) struct RetryInterceptor {
    opts: RetryOptions,
}

impl RetryInterceptor {
    pub(crate) fn new(opts: RetryOptions) -> RetryInterceptor {
        RetryInterceptor { opts }
    }
}

impl Interceptor for RetryInterceptor {
    fn proceed<'a>(
        &'a self,
        request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            if request.request_type() == RequestType::Chunk {
                return next.proceed(request).await;
            }

            let mut attempts = 0;
            loop {
                match next.proceed(request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(err) => {
                        if attempts >= self.opts.retries() || !self.opts.should_retry(&err) {
                            return Err(err);
                        }
                        attempts += 1;
                        debug!(
                            "retrying request to {} ({}/{}): {}",
                            request.uri(),
                            attempts,
                            self.opts.retries(),
                            err
                        );
                        let backoff = self.opts.backoff();
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        })
    }
}
