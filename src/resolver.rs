//! Host resolution and server selection.

use std::net::{IpAddr, SocketAddr};

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::request::HttpRequest;
use crate::{Error, Result};

/// Resolves a host name to an address.
///
/// Returning `None` falls back to system resolution.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str) -> BoxFuture<'static, Option<IpAddr>>;
}

impl<F> HostResolver for F
where
    F: Fn(&str) -> Option<IpAddr> + Send + Sync,
{
    fn resolve(&self, host: &str) -> BoxFuture<'static, Option<IpAddr>> {
        let resolved = (self)(host);
        Box::pin(async move { resolved })
    }
}

/// Resolution through the operating system, via tokio's resolver thread
/// pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str) -> BoxFuture<'static, Option<IpAddr>> {
        // lookup_host needs a port; it is discarded from the result.
        let target = format!("{}:0", host);
        Box::pin(async move {
            tokio::net::lookup_host(target)
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
                .map(|addr| addr.ip())
        })
    }
}

/// Picks the destination address for a request.
///
/// Fails the request with an unresolved-host error before any pool work
/// happens.
pub(crate) struct ServerSelector;

impl ServerSelector {
    pub(crate) async fn select(
        resolver: &dyn HostResolver,
        request: &HttpRequest,
        _ctx: &Context,
    ) -> Result<SocketAddr> {
        let host = request.host();
        let port = request.port();

        // A literal address needs no resolver round-trip.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        if let Some(ip) = resolver.resolve(host).await {
            return Ok(SocketAddr::new(ip, port));
        }

        // Configured resolver declined; fall back to the system.
        match SystemResolver.resolve(host).await {
            Some(ip) => Ok(SocketAddr::new(ip, port)),
            None => Err(Error::new_unresolved_host(host)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_address_skips_resolver() {
        let resolver = |_host: &str| -> Option<IpAddr> { panic!("resolver must not run") };
        let request = HttpRequest::get("http://127.0.0.1:8080/abc").build().unwrap();
        let ctx = Context::new();
        let addr = ServerSelector::select(&resolver, &request, &ctx)
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
    }

    #[tokio::test]
    async fn configured_resolver_wins() {
        let resolver = |_host: &str| Some(IpAddr::from([10, 0, 0, 7]));
        let request = HttpRequest::get("http://service.internal/").build().unwrap();
        let ctx = Context::new();
        let addr = ServerSelector::select(&resolver, &request, &ctx)
            .await
            .unwrap();
        assert_eq!(addr, "10.0.0.7:80".parse().unwrap());
    }
}
