//! Client configuration types.
//!
//! All option objects are plain `Clone` data. The builder holds them behind
//! `Arc` so that [`crate::ClientBuilder::copy`] can hand out deep copies of
//! the options while sharing singletons such as the resolver.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::Error;

/// The HTTP version a client is configured to speak.
///
/// `H2` enables ALPN negotiation (or, together with
/// [`crate::ClientBuilder::h2_clear_text_upgrade`], the prior-knowledge
/// cleartext preface). `H1_0` and `H1_1` pin the connection to HTTP/1.x.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum HttpVersion {
    H1_0,
    H1_1,
    H2,
}

/// A request scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Which content codings are advertised and decoded when
/// [`crate::ClientBuilder::use_decompress`] is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decompression {
    Gzip,
    Deflate,
    GzipDeflate,
}

impl Decompression {
    pub(crate) fn accept_encoding(&self) -> &'static str {
        match self {
            Decompression::Gzip => "gzip",
            Decompression::Deflate => "deflate",
            Decompression::GzipDeflate => "gzip, deflate",
        }
    }
}

/// Socket-level options applied to every new connection.
#[derive(Debug, Clone)]
pub struct NetOptions {
    tcp_nodelay: bool,
    so_keepalive: bool,
    /// Outbound bytes queued beyond this mark the connection unwritable.
    write_buffer_high_water_mark: usize,
}

impl NetOptions {
    pub fn of_default() -> Self {
        NetOptions {
            tcp_nodelay: true,
            so_keepalive: true,
            write_buffer_high_water_mark: 64 * 1024,
        }
    }

    pub fn tcp_nodelay(mut self, on: bool) -> Self {
        self.tcp_nodelay = on;
        self
    }

    pub fn so_keepalive(mut self, on: bool) -> Self {
        self.so_keepalive = on;
        self
    }

    pub fn write_buffer_high_water_mark(mut self, bytes: usize) -> Self {
        self.write_buffer_high_water_mark = bytes;
        self
    }

    pub(crate) fn is_tcp_nodelay(&self) -> bool {
        self.tcp_nodelay
    }

    pub(crate) fn is_so_keepalive(&self) -> bool {
        self.so_keepalive
    }

    pub(crate) fn high_water_mark(&self) -> usize {
        self.write_buffer_high_water_mark
    }
}

impl Default for NetOptions {
    fn default() -> Self {
        NetOptions::of_default()
    }
}

/// HTTP/1 codec limits.
#[derive(Debug, Clone)]
pub struct Http1Options {
    max_initial_line_length: usize,
    max_header_size: usize,
    max_chunk_size: usize,
}

impl Http1Options {
    pub fn of_default() -> Self {
        Http1Options {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_chunk_size: 8192,
        }
    }

    pub fn max_initial_line_length(mut self, len: usize) -> Self {
        self.max_initial_line_length = len;
        self
    }

    pub fn max_header_size(mut self, len: usize) -> Self {
        self.max_header_size = len;
        self
    }

    pub fn max_chunk_size(mut self, len: usize) -> Self {
        self.max_chunk_size = len;
        self
    }

    pub(crate) fn header_size_limit(&self) -> usize {
        self.max_initial_line_length + self.max_header_size
    }

    pub(crate) fn chunk_size_limit(&self) -> usize {
        self.max_chunk_size
    }
}

impl Default for Http1Options {
    fn default() -> Self {
        Http1Options::of_default()
    }
}

/// HTTP/2 connection settings, forwarded to the underlying h2 layer.
#[derive(Debug, Clone)]
pub struct Http2Options {
    header_table_size: u32,
    max_frame_size: u32,
    initial_window_size: u32,
}

impl Http2Options {
    pub fn of_default() -> Self {
        Http2Options {
            header_table_size: 4096,
            max_frame_size: 16 * 1024,
            initial_window_size: 65_535,
        }
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.header_table_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    pub(crate) fn apply(&self, builder: &mut h2::client::Builder) {
        builder
            .header_table_size(self.header_table_size)
            .max_frame_size(self.max_frame_size)
            .initial_window_size(self.initial_window_size);
    }
}

impl Default for Http2Options {
    fn default() -> Self {
        Http2Options::of_default()
    }
}

/// TLS handshake options.
#[derive(Debug, Clone)]
pub struct SslOptions {
    handshake_timeout: Option<Duration>,
    enabled_alpn: Vec<Vec<u8>>,
}

impl SslOptions {
    pub fn of_default() -> Self {
        SslOptions {
            handshake_timeout: None,
            enabled_alpn: Vec::new(),
        }
    }

    /// Deadline for the TLS handshake. When unset, the connect timeout is
    /// used instead.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Overrides the advertised ALPN protocols. When empty, the protocols
    /// are derived from the configured HTTP version.
    pub fn enabled_alpn<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.enabled_alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn handshake_timeout_or(&self, fallback: Duration) -> Duration {
        self.handshake_timeout.unwrap_or(fallback)
    }

    pub(crate) fn alpn_or(&self, fallback: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        if self.enabled_alpn.is_empty() {
            fallback
        } else {
            self.enabled_alpn.clone()
        }
    }
}

impl Default for SslOptions {
    fn default() -> Self {
        SslOptions::of_default()
    }
}

/// Retry policy for the built-in retry interceptor.
///
/// Passing `None` to [`crate::ClientBuilder::retry_options`] removes the
/// retry interceptor from the chain entirely.
#[derive(Clone)]
pub struct RetryOptions {
    max_retries: usize,
    interval: Duration,
    predicate: Arc<dyn Fn(&Error) -> bool + Send + Sync>,
}

impl RetryOptions {
    pub fn of_default() -> Self {
        RetryOptions {
            max_retries: 3,
            interval: Duration::ZERO,
            predicate: Arc::new(Error::is_retry_eligible),
        }
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replaces the default eligibility predicate.
    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub(crate) fn retries(&self) -> usize {
        self.max_retries
    }

    pub(crate) fn backoff(&self) -> Duration {
        self.interval
    }

    pub(crate) fn should_retry(&self, err: &Error) -> bool {
        (self.predicate)(err)
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions::of_default()
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Per-endpoint pool sizing.
#[derive(Debug, Clone)]
pub struct ChannelPoolOptions {
    pool_size: usize,
    waiting_queue_length: usize,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl ChannelPoolOptions {
    pub fn of_default() -> Self {
        ChannelPoolOptions {
            pool_size: 512,
            waiting_queue_length: 256,
            connect_timeout: Duration::from_secs(3),
            idle_timeout: None,
        }
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn waiting_queue_length(mut self, len: usize) -> Self {
        self.waiting_queue_length = len;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Idle connections older than this are discarded on acquire.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub(crate) fn size(&self) -> usize {
        self.pool_size
    }

    pub(crate) fn queue_length(&self) -> usize {
        self.waiting_queue_length
    }

    pub(crate) fn connect_deadline(&self) -> Duration {
        self.connect_timeout
    }

    pub(crate) fn idle_deadline(&self) -> Option<Duration> {
        self.idle_timeout
    }
}

impl Default for ChannelPoolOptions {
    fn default() -> Self {
        ChannelPoolOptions::of_default()
    }
}

/// Supplies per-endpoint pool options, overriding the builder-wide defaults.
///
/// Returning `None` keeps the defaults for that endpoint.
pub trait ChannelPoolOptionsProvider: Send + Sync {
    fn get(&self, authority: &str) -> Option<ChannelPoolOptions>;
}

impl<F> ChannelPoolOptionsProvider for F
where
    F: Fn(&str) -> Option<ChannelPoolOptions> + Send + Sync,
{
    fn get(&self, authority: &str) -> Option<ChannelPoolOptions> {
        (self)(authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_ports() {
        assert_eq!(Scheme::Http.default_port(), 80);
        assert_eq!(Scheme::Https.default_port(), 443);
    }

    #[test]
    fn ssl_options_fallbacks() {
        let opts = SslOptions::of_default();
        assert_eq!(
            opts.handshake_timeout_or(Duration::from_secs(3)),
            Duration::from_secs(3)
        );
        let opts = opts.handshake_timeout(Duration::from_secs(9));
        assert_eq!(
            opts.handshake_timeout_or(Duration::from_secs(3)),
            Duration::from_secs(9)
        );

        let alpn = SslOptions::of_default().alpn_or(vec![b"http/1.1".to_vec()]);
        assert_eq!(alpn, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn retry_default_predicate_follows_error_kind() {
        let opts = RetryOptions::of_default();
        assert!(opts.should_retry(&Error::new_pool_exhausted()));
        assert!(!opts.should_retry(&Error::new_read_timeout()));
    }
}
