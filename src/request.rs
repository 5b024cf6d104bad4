//! Request types and fluent builders.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};

use crate::config::Scheme;
use crate::{Error, Result};

/// Determines which request writer serialises the request onto a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// Headers plus an optional in-memory body in one write.
    Plain,
    /// The body is streamed by the caller through a chunk writer.
    Chunk,
    /// The body is streamed from a file on disk.
    File,
    /// Multipart form data (or form-urlencoded when multipart encoding is
    /// switched off).
    Multipart,
}

/// Per-request overrides of builder-wide defaults. Unset values fall back to
/// the client configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    read_timeout: Option<Duration>,
    uri_encode: Option<bool>,
    max_redirects: Option<usize>,
    expect_continue: Option<bool>,
}

impl RequestOptions {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn uri_encode(&self) -> Option<bool> {
        self.uri_encode
    }

    pub fn max_redirects(&self) -> Option<usize> {
        self.max_redirects
    }

    pub fn expect_continue(&self) -> Option<bool> {
        self.expect_continue
    }
}

#[derive(Clone)]
pub(crate) enum Body {
    None,
    Bytes(Bytes),
    File(PathBuf),
    Multipart(MultipartBody),
    Chunk,
}

/// The parts and attributes of a multipart request.
#[derive(Clone, Default)]
pub(crate) struct MultipartBody {
    pub(crate) multipart_encode: bool,
    pub(crate) parts: Vec<Part>,
    pub(crate) attrs: Vec<(String, String)>,
}

/// One file part of a multipart body.
#[derive(Clone)]
pub(crate) struct Part {
    pub(crate) name: String,
    pub(crate) file: PathBuf,
    pub(crate) filename: String,
    pub(crate) content_type: Option<HeaderValue>,
    /// Text parts carry `content-transfer-encoding: 8bit`, binary parts
    /// `binary`.
    pub(crate) text: bool,
}

/// An immutable HTTP request.
///
/// Built through the fluent entry points ([`HttpRequest::get`],
/// [`HttpRequest::post`], [`HttpRequest::multipart`], ...). The request type
/// tag selects the writer that puts it on the wire.
#[derive(Clone)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    kind: RequestType,
    config: RequestOptions,
}

impl HttpRequest {
    /// Starts a plain GET request.
    pub fn get(uri: &str) -> RequestBuilder {
        RequestBuilder::new(Method::GET, uri, RequestType::Plain)
    }

    /// Starts a plain POST request.
    pub fn post(uri: &str) -> RequestBuilder {
        RequestBuilder::new(Method::POST, uri, RequestType::Plain)
    }

    /// Starts a plain PUT request.
    pub fn put(uri: &str) -> RequestBuilder {
        RequestBuilder::new(Method::PUT, uri, RequestType::Plain)
    }

    /// Starts a plain DELETE request.
    pub fn delete(uri: &str) -> RequestBuilder {
        RequestBuilder::new(Method::DELETE, uri, RequestType::Plain)
    }

    /// Starts a plain HEAD request.
    pub fn head(uri: &str) -> RequestBuilder {
        RequestBuilder::new(Method::HEAD, uri, RequestType::Plain)
    }

    /// Starts a request whose body the caller streams through the chunk
    /// writer obtained from the response future or the request context.
    pub fn chunk(uri: &str) -> RequestBuilder {
        RequestBuilder::new(Method::POST, uri, RequestType::Chunk)
    }

    /// Starts a request whose body is streamed from a file.
    pub fn file(uri: &str, path: impl Into<PathBuf>) -> RequestBuilder {
        let mut b = RequestBuilder::new(Method::POST, uri, RequestType::File);
        b.file = Some(path.into());
        b
    }

    /// Starts a multipart request.
    pub fn multipart(uri: &str) -> MultipartRequestBuilder {
        MultipartRequestBuilder {
            inner: RequestBuilder::new(Method::POST, uri, RequestType::Multipart),
            body: MultipartBody {
                multipart_encode: true,
                ..MultipartBody::default()
            },
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn request_type(&self) -> RequestType {
        self.kind
    }

    pub fn config(&self) -> &RequestOptions {
        &self.config
    }

    pub(crate) fn body(&self) -> &Body {
        &self.body
    }

    pub fn scheme(&self) -> Scheme {
        match self.uri.scheme_str() {
            Some("https") => Scheme::Https,
            _ => Scheme::Http,
        }
    }

    pub fn host(&self) -> &str {
        self.uri.host().unwrap_or("")
    }

    pub fn port(&self) -> u16 {
        self.uri
            .port_u16()
            .unwrap_or_else(|| self.scheme().default_port())
    }

    /// The value carried in `Host` (HTTP/1) or `:authority` (HTTP/2):
    /// the host, plus the port when it is not the scheme default.
    pub(crate) fn authority(&self) -> String {
        match self.uri.port_u16() {
            Some(port) if port != self.scheme().default_port() => {
                format!("{}:{}", self.host(), port)
            }
            _ => self.host().to_owned(),
        }
    }

    /// Path and query as sent on the request line, percent-encoding the
    /// path when `uri_encode` is in effect.
    pub(crate) fn request_target(&self, uri_encode: bool) -> String {
        let path = self.uri.path();
        let path = if uri_encode {
            percent_encoding::utf8_percent_encode(path, percent_encoding::CONTROLS).to_string()
        } else {
            path.to_owned()
        };
        match self.uri.query() {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        }
    }

    pub(crate) fn replace_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn drop_body(&mut self) {
        self.body = Body::None;
        self.kind = RequestType::Plain;
    }
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("type", &self.kind)
            .finish()
    }
}

/// Builder for plain, chunked and file requests.
pub struct RequestBuilder {
    method: Method,
    uri: std::result::Result<Uri, http::uri::InvalidUri>,
    headers: HeaderMap,
    kind: RequestType,
    body: Option<Bytes>,
    file: Option<PathBuf>,
    config: RequestOptions,
}

impl RequestBuilder {
    fn new(method: Method, uri: &str, kind: RequestType) -> RequestBuilder {
        RequestBuilder {
            method,
            uri: uri.parse(),
            headers: HeaderMap::new(),
            kind,
            body: None,
            file: None,
            config: RequestOptions::default(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a header, keeping any values already present under the same
    /// name.
    pub fn header<V>(mut self, name: HeaderName, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
    {
        if let Ok(value) = value.try_into() {
            self.headers.append(name, value);
        }
        self
    }

    /// Sets an in-memory body. Only meaningful for plain requests.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn uri_encode(mut self, enabled: bool) -> Self {
        self.config.uri_encode = Some(enabled);
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = Some(max);
        self
    }

    pub fn expect_continue(mut self, enabled: bool) -> Self {
        self.config.expect_continue = Some(enabled);
        self
    }

    pub fn build(self) -> Result<HttpRequest> {
        let uri = self.uri.map_err(Error::new_parse)?;
        if uri.host().is_none() {
            return Err(Error::new_parse("request uri has no host"));
        }
        let body = match self.kind {
            RequestType::Chunk => Body::Chunk,
            RequestType::File => {
                let path = self
                    .file
                    .ok_or_else(|| Error::new_parse("file request has no file"))?;
                Body::File(path)
            }
            _ => match self.body {
                Some(bytes) => Body::Bytes(bytes),
                None => Body::None,
            },
        };
        Ok(HttpRequest {
            method: self.method,
            uri,
            headers: self.headers,
            body,
            kind: self.kind,
            config: self.config,
        })
    }
}

/// Builder for multipart (and form-urlencoded) requests.
pub struct MultipartRequestBuilder {
    inner: RequestBuilder,
    body: MultipartBody,
}

impl MultipartRequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.inner = self.inner.method(method);
        self
    }

    pub fn header<V>(mut self, name: HeaderName, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
    {
        self.inner = self.inner.header(name, value);
        self
    }

    /// Adds a file part. The file name defaults to the path's final
    /// component; `text` selects the 8bit transfer encoding.
    pub fn file_part(
        mut self,
        name: &str,
        path: impl Into<PathBuf>,
        content_type: Option<HeaderValue>,
        text: bool,
    ) -> Self {
        let file = path.into();
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_owned());
        self.body.parts.push(Part {
            name: name.to_owned(),
            file,
            filename,
            content_type,
            text,
        });
        self
    }

    /// Adds a simple name/value attribute.
    pub fn attribute(mut self, name: &str, value: &str) -> Self {
        self.body.attrs.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Switches between multipart/form-data (`true`, the default) and
    /// application/x-www-form-urlencoded (`false`). File parts require
    /// multipart encoding.
    pub fn multipart(mut self, multipart: bool) -> Self {
        self.body.multipart_encode = multipart;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.read_timeout(timeout);
        self
    }

    pub fn uri_encode(mut self, enabled: bool) -> Self {
        self.inner = self.inner.uri_encode(enabled);
        self
    }

    pub fn expect_continue(mut self, enabled: bool) -> Self {
        self.inner = self.inner.expect_continue(enabled);
        self
    }

    pub fn build(self) -> Result<HttpRequest> {
        if !self.body.multipart_encode && !self.body.parts.is_empty() {
            return Err(Error::new_parse(
                "file parts require multipart encoding",
            ));
        }
        let mut request = self.inner.build()?;
        request.body = Body::Multipart(self.body);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_builder_roundtrip() {
        let req = HttpRequest::post("http://127.0.0.1:8080/abc?x=1")
            .header(http::header::ACCEPT, "text/plain")
            .body("hello")
            .read_timeout(Duration::from_millis(700))
            .build()
            .unwrap();
        assert_eq!(req.method(), &Method::POST);
        assert_eq!(req.request_type(), RequestType::Plain);
        assert_eq!(req.host(), "127.0.0.1");
        assert_eq!(req.port(), 8080);
        assert_eq!(req.authority(), "127.0.0.1:8080");
        assert_eq!(req.request_target(false), "/abc?x=1");
        assert_eq!(req.config().read_timeout(), Some(Duration::from_millis(700)));
    }

    #[test]
    fn authority_omits_default_port() {
        let req = HttpRequest::get("http://example.com/").build().unwrap();
        assert_eq!(req.authority(), "example.com");
        let req = HttpRequest::get("https://example.com:443/").build().unwrap();
        assert_eq!(req.authority(), "example.com");
    }

    #[test]
    fn uri_without_host_is_rejected() {
        assert!(HttpRequest::get("/relative").build().is_err());
    }

    #[test]
    fn multipart_parts_and_attributes() {
        let req = HttpRequest::multipart("http://127.0.0.1/abc")
            .file_part("file", "/tmp/data.bin", None, true)
            .attribute("key1", "value1")
            .build()
            .unwrap();
        assert_eq!(req.request_type(), RequestType::Multipart);
        match req.body() {
            Body::Multipart(m) => {
                assert!(m.multipart_encode);
                assert_eq!(m.parts.len(), 1);
                assert_eq!(m.parts[0].filename, "data.bin");
                assert_eq!(m.attrs.len(), 1);
            }
            _ => panic!("expected multipart body"),
        }
    }

    #[test]
    fn form_urlencoded_rejects_file_parts() {
        let res = HttpRequest::multipart("http://127.0.0.1/abc")
            .file_part("file", "/tmp/data.bin", None, true)
            .multipart(false)
            .build();
        assert!(res.is_err());
    }
}
