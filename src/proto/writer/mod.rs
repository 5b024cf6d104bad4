//! Request writers: one per request type, selected by the transceiver.
//!
//! A writer owns the wire form of its request variant. The returned
//! `done` future resolves when the last request byte reached the
//! transport's outbound buffer; for chunked requests it resolves once the
//! headers are out and the caller streams the rest through the
//! [`ChunkWriter`].

mod chunked;
mod file;
mod multipart;
mod plain;

pub use chunked::ChunkWriter;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::header;
use tokio::sync::oneshot;

use crate::config::HttpVersion;
use crate::context::Context;
use crate::proto::channel::{Channel, RequestHead};
use crate::proto::handle::STREAM_ID_EXT;
use crate::request::{HttpRequest, RequestType};
use crate::Result;

/// What a writer hands back to the transceiver.
pub(crate) struct WriteOutcome {
    /// Resolves when the writer's part of the exchange is flushed.
    pub(crate) done: BoxFuture<'static, Result<()>>,
    /// The streaming handle of a chunked request.
    pub(crate) chunk: Option<ChunkWriter>,
}

pub(crate) trait RequestWriter: Send + Sync {
    fn write_and_flush(
        &self,
        request: &Arc<HttpRequest>,
        channel: &Channel,
        ctx: &Arc<Context>,
        uri_encode: bool,
        version: HttpVersion,
        http2: bool,
    ) -> WriteOutcome;
}

/// Picks the writer for a request type.
pub(crate) fn get_by_type(kind: RequestType) -> &'static dyn RequestWriter {
    match kind {
        RequestType::Plain => &plain::PlainWriter,
        RequestType::Chunk => &chunked::ChunkedWriter,
        RequestType::File => &file::FileWriter,
        RequestType::Multipart => &multipart::MultipartWriter,
    }
}

/// Builds the protocol-agnostic head for `request`. HTTP/1 heads carry a
/// conformant `Host` unless the caller already set one.
pub(crate) fn build_head(
    request: &HttpRequest,
    version: HttpVersion,
    http2: bool,
    uri_encode: bool,
) -> RequestHead {
    let mut headers = request.headers().clone();
    let authority = request.authority();
    if !http2 && !headers.contains_key(header::HOST) {
        if let Ok(value) = header::HeaderValue::from_str(&authority) {
            headers.insert(header::HOST, value);
        }
    }
    RequestHead {
        method: request.method().clone(),
        target: request.request_target(uri_encode),
        version: if http2 { HttpVersion::H2 } else { version },
        scheme: request.scheme(),
        authority,
        headers,
    }
}

/// The registry-assigned stream id carried in the request's extension
/// slot.
pub(crate) fn stream_id_of(request: &HttpRequest) -> u32 {
    request
        .headers()
        .get(STREAM_ID_EXT)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(1)
}

/// Installs the expect-continue resumption callback when the context asks
/// for it, returning the gate the writer awaits before streaming the body.
///
/// The callback is taken out of the context on first use, so repeated
/// 100-continue signals trigger the body exactly once. A dropped gate
/// means the exchange was answered without a continue: the body is
/// discarded.
pub(crate) fn continue_gate(ctx: &Context) -> Option<oneshot::Receiver<()>> {
    if !ctx.is_expect_continue_enabled() {
        return None;
    }
    let (tx, rx) = oneshot::channel();
    ctx.set_expect_continue_callback(Box::new(move || {
        let _ = tx.send(());
    }));
    Some(rx)
}

/// Segment size for streamed bodies.
pub(crate) const SEGMENT: usize = 8 * 1024;
