//! Redirect-following interceptor.

use futures_util::future::BoxFuture;
use http::{header, Method, StatusCode, Uri};
use tracing::debug;

use crate::exec::{Interceptor, Next};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::Result;

/// Follows 3xx responses up to a bounded number of hops.
///
/// 303 responses switch to GET and drop the body; 307/308 preserve method
/// and body. 301/302 are treated like 303 for non-GET/HEAD methods, the
/// behaviour ubiquitous among clients.
pub(crate) struct RedirectInterceptor {
    max_redirects: usize,
}

impl RedirectInterceptor {
    pub(crate) fn new(max_redirects: usize) -> RedirectInterceptor {
        RedirectInterceptor { max_redirects }
    }
}

impl Interceptor for RedirectInterceptor {
    fn proceed<'a>(
        &'a self,
        request: HttpRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            let max = request
                .config()
                .max_redirects()
                .unwrap_or(self.max_redirects);
            let mut request = request;
            let mut hops = 0;

            loop {
                let response = next.proceed(request.clone()).await?;
                if hops >= max || !is_redirect(response.status()) {
                    return Ok(response);
                }
                let Some(location) = location_of(&response, request.uri()) else {
                    return Ok(response);
                };

                hops += 1;
                debug!(
                    "following redirect {} -> {} ({}/{})",
                    request.uri(),
                    location,
                    hops,
                    max
                );
                request.replace_uri(location);
                if downgrades_to_get(response.status(), request.method()) {
                    request.set_method(Method::GET);
                    request.drop_body();
                    request.headers_mut().remove(header::CONTENT_LENGTH);
                    request.headers_mut().remove(header::CONTENT_TYPE);
                    request.headers_mut().remove(header::TRANSFER_ENCODING);
                }
                request.headers_mut().remove(header::HOST);
            }
        })
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn downgrades_to_get(status: StatusCode, method: &Method) -> bool {
    match status {
        StatusCode::SEE_OTHER => method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
            method != Method::GET && method != Method::HEAD
        }
        _ => false,
    }
}

/// Resolves the `Location` header against the request URI.
fn location_of(response: &HttpResponse, base: &Uri) -> Option<Uri> {
    let location = response.headers().get(header::LOCATION)?.to_str().ok()?;
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.parse().ok();
    }

    // Origin-relative target: keep scheme and authority.
    let scheme = base.scheme_str()?;
    let authority = base.authority()?.as_str();
    let path = if location.starts_with('/') {
        location.to_owned()
    } else {
        let dir = base.path().rsplit_once('/').map(|(d, _)| d).unwrap_or("");
        format!("{}/{}", dir, location)
    };
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path.as_str())
        .build()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpVersion;
    use bytes::Bytes;
    use http::HeaderMap;

    fn redirect_rsp(status: StatusCode, location: &str) -> HttpResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, location.parse().unwrap());
        HttpResponse::new(status, HttpVersion::H1_1, headers, Bytes::new())
    }

    #[test]
    fn relative_location_is_resolved_against_base() {
        let base: Uri = "http://example.com/a/b?q=1".parse().unwrap();
        let rsp = redirect_rsp(StatusCode::FOUND, "/c");
        assert_eq!(
            location_of(&rsp, &base).unwrap().to_string(),
            "http://example.com/c"
        );
        let rsp = redirect_rsp(StatusCode::FOUND, "d");
        assert_eq!(
            location_of(&rsp, &base).unwrap().to_string(),
            "http://example.com/a/d"
        );
    }

    #[test]
    fn see_other_downgrades_post_to_get() {
        assert!(downgrades_to_get(StatusCode::SEE_OTHER, &Method::POST));
        assert!(downgrades_to_get(StatusCode::FOUND, &Method::POST));
        assert!(!downgrades_to_get(StatusCode::TEMPORARY_REDIRECT, &Method::POST));
        assert!(!downgrades_to_get(StatusCode::FOUND, &Method::GET));
    }
}
