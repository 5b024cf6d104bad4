//! Client builder.

use std::sync::Arc;
use std::time::Duration;

use crate::client::HttpClient;
use crate::config::{
    ChannelPoolOptions, ChannelPoolOptionsProvider, Decompression, Http1Options, Http2Options,
    HttpVersion, NetOptions, RetryOptions, SslOptions,
};
use crate::exec::{
    ExpectContinueInterceptor, FilteringExec, Interceptor, RedirectInterceptor, RetryInterceptor,
};
use crate::filter::{
    DuplexFilter, DuplexRequestSide, DuplexResponseSide, RequestFilter, ResponseFilter,
};
use crate::resolver::{HostResolver, SystemResolver};

/// Configures and builds an [`HttpClient`].
///
/// The default interceptor chain is `[Retry, Redirect, Filtering,
/// ExpectContinue]`; disabling retry removes its slot, user interceptors
/// append after the built-ins. `copy()` deep-copies option objects but
/// shares singletons (the resolver and the pool-options provider).
pub struct ClientBuilder {
    resolver: Arc<dyn HostResolver>,
    h2_clear_text_upgrade: bool,
    connect_timeout: Duration,
    read_timeout: Duration,
    keep_alive: bool,
    version: HttpVersion,
    connection_pool_size: usize,
    connection_pool_waiting_queue_length: usize,
    use_decompress: bool,
    decompression: Decompression,
    expect_continue_enabled: bool,
    uri_encode_enabled: bool,
    channel_pool_options_provider: Option<Arc<dyn ChannelPoolOptionsProvider>>,
    net_options: Arc<NetOptions>,
    http1_options: Arc<Http1Options>,
    http2_options: Arc<Http2Options>,
    retry_options: Option<Arc<RetryOptions>>,
    max_redirects: usize,
    max_content_length: u64,
    ssl_options: Arc<SslOptions>,
    request_filters: Vec<Arc<dyn RequestFilter>>,
    response_filters: Vec<Arc<dyn ResponseFilter>>,
    filtering: Arc<FilteringExec>,
    user_interceptors: Vec<Arc<dyn Interceptor>>,
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            resolver: Arc::new(SystemResolver),
            h2_clear_text_upgrade: false,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(6),
            keep_alive: true,
            version: HttpVersion::H1_1,
            connection_pool_size: 512,
            connection_pool_waiting_queue_length: 256,
            use_decompress: false,
            decompression: Decompression::GzipDeflate,
            expect_continue_enabled: false,
            uri_encode_enabled: false,
            channel_pool_options_provider: None,
            net_options: Arc::new(NetOptions::of_default()),
            http1_options: Arc::new(Http1Options::of_default()),
            http2_options: Arc::new(Http2Options::of_default()),
            retry_options: Some(Arc::new(RetryOptions::of_default())),
            max_redirects: 5,
            max_content_length: 4 * 1024 * 1024,
            ssl_options: Arc::new(SslOptions::of_default()),
            request_filters: Vec::new(),
            response_filters: Vec::new(),
            filtering: Arc::new(FilteringExec::new(Vec::new(), Vec::new())),
            user_interceptors: Vec::new(),
        }
    }

    pub fn resolver(mut self, resolver: impl HostResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Enables prior-knowledge cleartext HTTP/2 for plain endpoints when
    /// the configured version is HTTP/2.
    pub fn h2_clear_text_upgrade(mut self, enabled: bool) -> Self {
        self.h2_clear_text_upgrade = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn version(mut self, version: HttpVersion) -> Self {
        self.version = version;
        self
    }

    pub fn connection_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = size;
        self
    }

    pub fn connection_pool_waiting_queue_length(mut self, len: usize) -> Self {
        self.connection_pool_waiting_queue_length = len;
        self
    }

    pub fn use_decompress(mut self, enabled: bool) -> Self {
        self.use_decompress = enabled;
        self
    }

    pub fn decompression(mut self, decompression: Decompression) -> Self {
        self.decompression = decompression;
        self
    }

    pub fn expect_continue_enabled(mut self, enabled: bool) -> Self {
        self.expect_continue_enabled = enabled;
        self
    }

    pub fn uri_encode_enabled(mut self, enabled: bool) -> Self {
        self.uri_encode_enabled = enabled;
        self
    }

    pub fn channel_pool_options_provider(
        mut self,
        provider: impl ChannelPoolOptionsProvider + 'static,
    ) -> Self {
        self.channel_pool_options_provider = Some(Arc::new(provider));
        self
    }

    pub fn net_options(mut self, options: NetOptions) -> Self {
        self.net_options = Arc::new(options);
        self
    }

    pub fn http1_options(mut self, options: Http1Options) -> Self {
        self.http1_options = Arc::new(options);
        self
    }

    pub fn http2_options(mut self, options: Http2Options) -> Self {
        self.http2_options = Arc::new(options);
        self
    }

    /// Configures the retry interceptor; `None` removes it from the chain.
    pub fn retry_options(mut self, options: Option<RetryOptions>) -> Self {
        self.retry_options = options.map(Arc::new);
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn max_content_length(mut self, max: u64) -> Self {
        self.max_content_length = max;
        self
    }

    pub fn ssl_options(mut self, options: SslOptions) -> Self {
        self.ssl_options = Arc::new(options);
        self
    }

    /// Appends a user interceptor after the built-in chain.
    pub fn add_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.user_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn add_interceptors<I>(mut self, interceptors: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Interceptor>>,
    {
        self.user_interceptors.extend(interceptors);
        self
    }

    pub fn add_request_filter(mut self, filter: impl RequestFilter + 'static) -> Self {
        self.request_filters.push(Arc::new(filter));
        self.rebuild_filtering();
        self
    }

    pub fn add_request_filters<I>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn RequestFilter>>,
    {
        self.request_filters.extend(filters);
        self.rebuild_filtering();
        self
    }

    pub fn add_response_filter(mut self, filter: impl ResponseFilter + 'static) -> Self {
        self.response_filters.push(Arc::new(filter));
        self.rebuild_filtering();
        self
    }

    pub fn add_response_filters<I>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ResponseFilter>>,
    {
        self.response_filters.extend(filters);
        self.rebuild_filtering();
        self
    }

    /// Registers a filter participating in both directions.
    pub fn add_filter(mut self, filter: impl DuplexFilter + 'static) -> Self {
        let filter: Arc<dyn DuplexFilter> = Arc::new(filter);
        self.request_filters
            .push(Arc::new(DuplexRequestSide(Arc::clone(&filter))));
        self.response_filters
            .push(Arc::new(DuplexResponseSide(filter)));
        self.rebuild_filtering();
        self
    }

    pub fn add_filters<I>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn DuplexFilter>>,
    {
        for filter in filters {
            self.request_filters
                .push(Arc::new(DuplexRequestSide(Arc::clone(&filter))));
            self.response_filters
                .push(Arc::new(DuplexResponseSide(filter)));
        }
        self.rebuild_filtering();
        self
    }

    // Every filter mutation produces a fresh Filtering slot so that chain
    // snapshots taken before and after differ by identity.
    fn rebuild_filtering(&mut self) {
        self.filtering = Arc::new(FilteringExec::new(
            self.request_filters.clone(),
            self.response_filters.clone(),
        ));
    }

    /// The current interceptor chain, built-ins first, as an immutable
    /// snapshot.
    pub fn unmodifiable_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        let mut chain: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(4 + self.user_interceptors.len());
        if let Some(retry) = &self.retry_options {
            chain.push(Arc::new(RetryInterceptor::new((**retry).clone())));
        }
        chain.push(Arc::new(RedirectInterceptor::new(self.max_redirects)));
        chain.push(Arc::clone(&self.filtering) as Arc<dyn Interceptor>);
        chain.push(Arc::new(ExpectContinueInterceptor::new(
            self.expect_continue_enabled,
        )));
        chain.extend(self.user_interceptors.iter().cloned());
        chain
    }

    /// Duplicates this builder: scalars and singletons (resolver,
    /// pool-options provider) are shared, option objects are deep-copied.
    pub fn copy(&self) -> ClientBuilder {
        ClientBuilder {
            resolver: Arc::clone(&self.resolver),
            h2_clear_text_upgrade: self.h2_clear_text_upgrade,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            keep_alive: self.keep_alive,
            version: self.version,
            connection_pool_size: self.connection_pool_size,
            connection_pool_waiting_queue_length: self.connection_pool_waiting_queue_length,
            use_decompress: self.use_decompress,
            decompression: self.decompression,
            expect_continue_enabled: self.expect_continue_enabled,
            uri_encode_enabled: self.uri_encode_enabled,
            channel_pool_options_provider: self.channel_pool_options_provider.clone(),
            net_options: Arc::new((*self.net_options).clone()),
            http1_options: Arc::new((*self.http1_options).clone()),
            http2_options: Arc::new((*self.http2_options).clone()),
            retry_options: self
                .retry_options
                .as_ref()
                .map(|opts| Arc::new((**opts).clone())),
            max_redirects: self.max_redirects,
            max_content_length: self.max_content_length,
            ssl_options: Arc::new((*self.ssl_options).clone()),
            request_filters: self.request_filters.clone(),
            response_filters: self.response_filters.clone(),
            filtering: Arc::new(FilteringExec::new(
                self.request_filters.clone(),
                self.response_filters.clone(),
            )),
            user_interceptors: self.user_interceptors.clone(),
        }
    }

    pub fn build(self) -> HttpClient {
        HttpClient::from_builder(self)
    }

    // ===== accessors, mirrored by the copy/identity tests =====

    pub fn get_resolver(&self) -> &Arc<dyn HostResolver> {
        &self.resolver
    }

    pub fn is_h2_clear_text_upgrade(&self) -> bool {
        self.h2_clear_text_upgrade
    }

    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn get_read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn get_version(&self) -> HttpVersion {
        self.version
    }

    pub fn get_connection_pool_size(&self) -> usize {
        self.connection_pool_size
    }

    pub fn get_connection_pool_waiting_queue_length(&self) -> usize {
        self.connection_pool_waiting_queue_length
    }

    pub fn is_use_decompress(&self) -> bool {
        self.use_decompress
    }

    pub fn get_decompression(&self) -> Decompression {
        self.decompression
    }

    pub fn is_expect_continue_enabled(&self) -> bool {
        self.expect_continue_enabled
    }

    pub fn is_uri_encode_enabled(&self) -> bool {
        self.uri_encode_enabled
    }

    pub fn get_channel_pool_options_provider(&self) -> Option<&Arc<dyn ChannelPoolOptionsProvider>> {
        self.channel_pool_options_provider.as_ref()
    }

    pub fn get_net_options(&self) -> &Arc<NetOptions> {
        &self.net_options
    }

    pub fn get_http1_options(&self) -> &Arc<Http1Options> {
        &self.http1_options
    }

    pub fn get_http2_options(&self) -> &Arc<Http2Options> {
        &self.http2_options
    }

    pub fn get_retry_options(&self) -> Option<&Arc<RetryOptions>> {
        self.retry_options.as_ref()
    }

    pub fn get_max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn get_max_content_length(&self) -> u64 {
        self.max_content_length
    }

    pub fn get_ssl_options(&self) -> &Arc<SslOptions> {
        &self.ssl_options
    }

    pub(crate) fn pool_defaults(&self) -> ChannelPoolOptions {
        ChannelPoolOptions::of_default()
            .pool_size(self.connection_pool_size)
            .waiting_queue_length(self.connection_pool_waiting_queue_length)
            .connect_timeout(self.connect_timeout)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thin_ptr<T: ?Sized>(arc: &Arc<T>) -> *const u8 {
        Arc::as_ptr(arc) as *const u8
    }

    #[test]
    fn basic_options_roundtrip() {
        let resolver = |_: &str| -> Option<std::net::IpAddr> { None };
        let provider =
            |_: &str| -> Option<ChannelPoolOptions> { Some(ChannelPoolOptions::of_default()) };

        let builder = ClientBuilder::new()
            .resolver(resolver)
            .h2_clear_text_upgrade(true)
            .connect_timeout(Duration::from_millis(1200))
            .read_timeout(Duration::from_millis(3400))
            .keep_alive(false)
            .version(HttpVersion::H2)
            .connection_pool_size(77)
            .connection_pool_waiting_queue_length(33)
            .use_decompress(true)
            .decompression(Decompression::GzipDeflate)
            .expect_continue_enabled(true)
            .uri_encode_enabled(true)
            .channel_pool_options_provider(provider)
            .max_redirects(9)
            .max_content_length(10_000);

        assert!(builder.is_h2_clear_text_upgrade());
        assert_eq!(builder.get_connect_timeout(), Duration::from_millis(1200));
        assert_eq!(builder.get_read_timeout(), Duration::from_millis(3400));
        assert!(!builder.is_keep_alive());
        assert_eq!(builder.get_version(), HttpVersion::H2);
        assert_eq!(builder.get_connection_pool_size(), 77);
        assert_eq!(builder.get_connection_pool_waiting_queue_length(), 33);
        assert!(builder.is_use_decompress());
        assert_eq!(builder.get_decompression(), Decompression::GzipDeflate);
        assert!(builder.is_expect_continue_enabled());
        assert!(builder.is_uri_encode_enabled());
        assert!(builder.get_channel_pool_options_provider().is_some());
        assert_eq!(builder.get_max_redirects(), 9);
        assert_eq!(builder.get_max_content_length(), 10_000);
    }

    #[test]
    fn copy_shares_singletons_and_duplicates_options() {
        let builder = ClientBuilder::new().channel_pool_options_provider(
            |_: &str| -> Option<ChannelPoolOptions> { None },
        );
        let copied = builder.copy();

        // Singletons by identity.
        assert_eq!(
            thin_ptr(builder.get_resolver()),
            thin_ptr(copied.get_resolver())
        );
        assert_eq!(
            thin_ptr(builder.get_channel_pool_options_provider().unwrap()),
            thin_ptr(copied.get_channel_pool_options_provider().unwrap())
        );

        // Option objects are fresh copies.
        assert_ne!(
            thin_ptr(builder.get_net_options()),
            thin_ptr(copied.get_net_options())
        );
        assert_ne!(
            thin_ptr(builder.get_http1_options()),
            thin_ptr(copied.get_http1_options())
        );
        assert_ne!(
            thin_ptr(builder.get_http2_options()),
            thin_ptr(copied.get_http2_options())
        );
        assert_ne!(
            thin_ptr(builder.get_retry_options().unwrap()),
            thin_ptr(copied.get_retry_options().unwrap())
        );

        // Scalars survive the copy.
        assert_eq!(builder.get_connect_timeout(), copied.get_connect_timeout());
        assert_eq!(builder.get_version(), copied.get_version());
    }

    #[test]
    fn default_chain_has_four_interceptors() {
        let builder = ClientBuilder::new();
        assert_eq!(builder.unmodifiable_interceptors().len(), 4);
    }

    #[test]
    fn null_retry_options_shrinks_chain() {
        let builder = ClientBuilder::new().retry_options(None);
        assert_eq!(builder.unmodifiable_interceptors().len(), 3);
    }

    #[test]
    fn user_interceptors_append() {
        struct Passthrough;
        impl Interceptor for Passthrough {
            fn proceed<'a>(
                &'a self,
                request: crate::HttpRequest,
                next: crate::Next<'a>,
            ) -> futures_util::future::BoxFuture<'a, crate::Result<crate::HttpResponse>>
            {
                next.proceed(request)
            }
        }
        let builder = ClientBuilder::new()
            .add_interceptor(Passthrough)
            .add_interceptors(vec![Arc::new(Passthrough) as Arc<dyn Interceptor>]);
        assert_eq!(builder.unmodifiable_interceptors().len(), 6);
    }

    #[test]
    fn filter_mutation_replaces_filtering_slot_identity() {
        let mut builder = ClientBuilder::new();
        let slot = |b: &ClientBuilder| thin_ptr(&b.unmodifiable_interceptors()[2]);
        let before = slot(&builder);

        builder = builder
            .add_request_filter(|_: &mut crate::HttpRequest, _: &crate::FilterContext| Ok(()));
        let after_request = slot(&builder);
        assert_ne!(before, after_request);
        assert_eq!(builder.unmodifiable_interceptors().len(), 4);

        builder = builder
            .add_response_filter(|_: &mut crate::HttpResponse, _: &crate::FilterContext| Ok(()));
        let after_response = slot(&builder);
        assert_ne!(after_request, after_response);
        assert_eq!(builder.unmodifiable_interceptors().len(), 4);
    }
}
