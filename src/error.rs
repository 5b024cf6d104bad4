//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can fail with `courier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur while handling an HTTP request.
///
/// # Formatting
///
/// The `Display` implementation of this type will only print the details of
/// this level of error, even though it may have been caused by another error
/// and contain that error in its source. To print all the relevant
/// information, including the source chain, use something like
/// `std::error::Report`, or equivalent 3rd party types.
///
/// # Source
///
/// A `courier::Error` may be caused by another error. To aid debugging,
/// those are exposed in `Error::source()` as erased types. While it is
/// possible to check the exact type of the sources, they **can not be
/// depended on**. They may come from private internal dependencies, and are
/// subject to change at any moment.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// The destination host could not be resolved to an address.
    UnresolvedHost,
    /// The per-endpoint pool and its waiting queue are both full.
    PoolExhausted,
    /// Establishing the TCP connection failed or timed out.
    ConnectFailed,
    /// TLS, ALPN or the h2 preface exchange failed.
    HandshakeFailed,
    /// A pooled connection turned out to be dead when revalidated.
    ConnectionInactive,
    /// The connection's outbound buffer is above its high-water mark.
    WriteBufferFull,
    /// The transport rejected the request write.
    WriteFailed,
    /// No response arrived before the read timeout fired.
    ReadTimeout,
    /// An I/O error occurred while streaming the request body.
    Encoding,
    /// The request was cancelled before it completed.
    Canceled,
    /// The connection closed while responses were still outstanding.
    ChannelClosed,
    /// An invalid response head was received.
    Parse,
    /// The aggregated response body exceeded `max_content_length`.
    MessageTooLarge,
    /// A generic error occurred while reading or writing the transport.
    Io,
    /// An error from the underlying HTTP/2 layer.
    Http2,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub(crate) fn new_unresolved_host(host: &str) -> Error {
        Error::new(Kind::UnresolvedHost).with(format!("failed to resolve host {:?}", host))
    }

    pub(crate) fn new_pool_exhausted() -> Error {
        Error::new(Kind::PoolExhausted)
    }

    pub(crate) fn new_connect(cause: std::io::Error) -> Error {
        Error::new(Kind::ConnectFailed).with(cause)
    }

    pub(crate) fn new_connect_timeout() -> Error {
        Error::new(Kind::ConnectFailed).with("connect timed out")
    }

    pub(crate) fn new_handshake<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::HandshakeFailed).with(cause)
    }

    pub(crate) fn new_connection_inactive() -> Error {
        Error::new(Kind::ConnectionInactive)
    }

    pub(crate) fn new_write_buffer_full() -> Error {
        Error::new(Kind::WriteBufferFull)
    }

    pub(crate) fn new_write<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::WriteFailed).with(cause)
    }

    pub(crate) fn new_read_timeout() -> Error {
        Error::new(Kind::ReadTimeout)
    }

    pub(crate) fn new_encoding(cause: std::io::Error) -> Error {
        Error::new(Kind::Encoding).with(cause)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_parse<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Parse).with(cause)
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::MessageTooLarge)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_h2(cause: h2::Error) -> Error {
        Error::new(Kind::Http2).with(cause)
    }

    /// Returns true if the host could not be resolved.
    pub fn is_unresolved_host(&self) -> bool {
        matches!(self.inner.kind, Kind::UnresolvedHost)
    }

    /// Returns true if the connection pool rejected the request because its
    /// waiting queue was full.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolExhausted)
    }

    /// Returns true if connecting to the remote endpoint failed.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectFailed)
    }

    /// Returns true if TLS, ALPN or the HTTP/2 preface exchange failed.
    pub fn is_handshake(&self) -> bool {
        matches!(self.inner.kind, Kind::HandshakeFailed)
    }

    /// Returns true if a pooled connection was dead on revalidation.
    pub fn is_connection_inactive(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectionInactive)
    }

    /// Returns true if the write buffer high-water mark was exceeded.
    pub fn is_write_buffer_full(&self) -> bool {
        matches!(self.inner.kind, Kind::WriteBufferFull)
    }

    /// Returns true if the transport rejected the request write.
    pub fn is_write(&self) -> bool {
        matches!(self.inner.kind, Kind::WriteFailed)
    }

    /// Returns true if the read timeout fired before the response ended.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::ReadTimeout)
    }

    /// Returns true if streaming the request body failed with an I/O error.
    pub fn is_encoding(&self) -> bool {
        matches!(self.inner.kind, Kind::Encoding)
    }

    /// Returns true if the request was cancelled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the connection closed with this response outstanding.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if the response head could not be parsed.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse)
    }

    /// Returns true if the aggregated response body exceeded the configured
    /// maximum content length.
    pub fn is_message_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::MessageTooLarge)
    }

    /// Whether a fresh attempt of the same request may succeed.
    ///
    /// Only errors raised before the exchange got underway qualify; a timed
    /// out or half-written exchange must not be replayed blindly.
    pub(crate) fn is_retry_eligible(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::PoolExhausted
                | Kind::ConnectFailed
                | Kind::HandshakeFailed
                | Kind::ConnectionInactive
                | Kind::WriteBufferFull
                | Kind::WriteFailed
        )
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::UnresolvedHost => "failed to resolve host",
            Kind::PoolExhausted => "connection pool waiting queue is full",
            Kind::ConnectFailed => "connect failed",
            Kind::HandshakeFailed => "handshake failed",
            Kind::ConnectionInactive => "connection is inactive",
            Kind::WriteBufferFull => "connection write buffer is full",
            Kind::WriteFailed => "failed to write request",
            Kind::ReadTimeout => "read timed out",
            Kind::Encoding => "error while encoding request body",
            Kind::Canceled => "request was canceled",
            Kind::ChannelClosed => "connection closed",
            Kind::Parse => "invalid response",
            Kind::MessageTooLarge => "response body exceeds the configured maximum",
            Kind::Io => "transport error",
            Kind::Http2 => "http2 error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("courier::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<h2::Error> for Error {
    fn from(err: h2::Error) -> Error {
        Error::new_h2(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn error_size_of() {
        assert_eq!(mem::size_of::<Error>(), mem::size_of::<usize>());
    }

    #[test]
    fn error_display_is_kind_only() {
        let err = Error::new_io(std::io::Error::new(std::io::ErrorKind::Other, "inner"));
        assert_eq!(err.to_string(), "transport error");
        assert!(err.source().is_some());
    }

    #[test]
    fn retry_eligibility() {
        assert!(Error::new_pool_exhausted().is_retry_eligible());
        assert!(Error::new_connection_inactive().is_retry_eligible());
        assert!(Error::new_write_buffer_full().is_retry_eligible());
        assert!(!Error::new_read_timeout().is_retry_eligible());
        assert!(!Error::new_canceled().is_retry_eligible());
    }
}
