//! Response type.

use std::io::Read;

use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};

use crate::config::{Decompression, HttpVersion};
use crate::{Error, Result};

/// A received HTTP response with its body aggregated in memory.
///
/// The default response handle aggregates the body up to the configured
/// `max_content_length` before the response future resolves.
pub struct HttpResponse {
    status: StatusCode,
    version: HttpVersion,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    pub(crate) fn new(
        status: StatusCode,
        version: HttpVersion,
        headers: HeaderMap,
        body: Bytes,
    ) -> HttpResponse {
        HttpResponse {
            status,
            version,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Inflates the body in place when its `Content-Encoding` matches one of
    /// the accepted codings, dropping the then-stale `Content-Encoding` and
    /// `Content-Length` headers.
    pub(crate) fn decompress(&mut self, accepted: Decompression) -> Result<()> {
        let encoding = match self.headers.get(header::CONTENT_ENCODING) {
            Some(v) => match v.to_str() {
                Ok(s) => s.trim().to_ascii_lowercase(),
                Err(_) => return Ok(()),
            },
            None => return Ok(()),
        };

        let decoded = match (encoding.as_str(), accepted) {
            ("gzip", Decompression::Gzip | Decompression::GzipDeflate) => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(&self.body[..])
                    .read_to_end(&mut out)
                    .map_err(Error::new_io)?;
                out
            }
            ("deflate", Decompression::Deflate | Decompression::GzipDeflate) => {
                let mut out = Vec::new();
                flate2::read::ZlibDecoder::new(&self.body[..])
                    .read_to_end(&mut out)
                    .map_err(Error::new_io)?;
                out
            }
            _ => return Ok(()),
        };

        self.headers.remove(header::CONTENT_ENCODING);
        self.headers.remove(header::CONTENT_LENGTH);
        self.body = Bytes::from(decoded);
        Ok(())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn gzipped(data: &[u8]) -> Bytes {
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        Bytes::from(enc.finish().unwrap())
    }

    #[test]
    fn gzip_body_is_inflated() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let mut rsp = HttpResponse::new(
            StatusCode::OK,
            HttpVersion::H1_1,
            headers,
            gzipped(b"hello world"),
        );
        rsp.decompress(Decompression::GzipDeflate).unwrap();
        assert_eq!(&rsp.body()[..], b"hello world");
        assert!(rsp.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[test]
    fn mismatched_coding_is_left_alone() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
        let body = gzipped(b"payload");
        let mut rsp = HttpResponse::new(
            StatusCode::OK,
            HttpVersion::H1_1,
            headers,
            body.clone(),
        );
        rsp.decompress(Decompression::Deflate).unwrap();
        assert_eq!(rsp.body(), &body);
        assert!(rsp.headers().get(header::CONTENT_ENCODING).is_some());
    }
}
