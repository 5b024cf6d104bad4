//! Writer for caller-streamed (chunked) request bodies.
//!
//! `write_and_flush` puts the headers out; the body is fed afterwards
//! through the [`ChunkWriter`] published in the request context, until
//! [`ChunkWriter::end`] closes the message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::Shared;
use futures_util::FutureExt;
use http::header;
use tokio::sync::oneshot;

use crate::config::HttpVersion;
use crate::context::Context;
use crate::proto::channel::{Channel, OutboundMsg};
use crate::proto::writer::{build_head, stream_id_of, RequestWriter, WriteOutcome};
use crate::request::HttpRequest;
use crate::{Error, Result};

type HeadGate = Shared<oneshot::Receiver<()>>;

struct ChunkInner {
    channel: Channel,
    http2: bool,
    stream_id: u32,
    /// Completed once the headers are on their way; body writes queue
    /// behind it.
    head_sent: HeadGate,
    ended: AtomicBool,
}

/// Streams body bytes into an in-flight chunked request.
///
/// Obtained from the response future (or the request context) once the
/// request has been dispatched. Cloneable; all clones feed the same
/// message.
#[derive(Clone)]
pub struct ChunkWriter {
    inner: Arc<ChunkInner>,
}

impl ChunkWriter {
    /// Appends one body segment.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        if self.inner.ended.load(Ordering::Acquire) {
            return Err(Error::new_write("chunk writer already ended"));
        }
        self.await_head().await?;
        if self.inner.http2 {
            self.inner
                .channel
                .write(OutboundMsg::H2Data {
                    stream_id: self.inner.stream_id,
                    data,
                    end_stream: false,
                })
                .await
        } else {
            self.inner
                .channel
                .write(OutboundMsg::H1Data {
                    data,
                    chunked: true,
                    end: false,
                })
                .await
        }
    }

    /// Terminates the body. Further writes fail.
    pub async fn end(&self) -> Result<()> {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return Err(Error::new_write("chunk writer already ended"));
        }
        self.await_head().await?;
        if self.inner.http2 {
            self.inner
                .channel
                .write(OutboundMsg::H2Data {
                    stream_id: self.inner.stream_id,
                    data: Bytes::new(),
                    end_stream: true,
                })
                .await
        } else {
            self.inner
                .channel
                .write(OutboundMsg::H1Data {
                    data: Bytes::new(),
                    chunked: true,
                    end: true,
                })
                .await
        }
    }

    async fn await_head(&self) -> Result<()> {
        self.inner
            .head_sent
            .clone()
            .await
            .map_err(|_| Error::new_closed())
    }
}

impl std::fmt::Debug for ChunkWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkWriter")
            .field("stream_id", &self.inner.stream_id)
            .field("ended", &self.inner.ended.load(Ordering::Acquire))
            .finish()
    }
}

pub(crate) struct ChunkedWriter;

impl RequestWriter for ChunkedWriter {
    fn write_and_flush(
        &self,
        request: &Arc<HttpRequest>,
        channel: &Channel,
        _ctx: &Arc<Context>,
        uri_encode: bool,
        version: HttpVersion,
        http2: bool,
    ) -> WriteOutcome {
        let mut head = build_head(request, version, http2, uri_encode);
        if !http2 {
            head.headers.remove(header::CONTENT_LENGTH);
            head.headers.insert(
                header::TRANSFER_ENCODING,
                header::HeaderValue::from_static("chunked"),
            );
        }

        let stream_id = stream_id_of(request);
        let (head_tx, head_rx) = oneshot::channel();
        let chunk = ChunkWriter {
            inner: Arc::new(ChunkInner {
                channel: channel.clone(),
                http2,
                stream_id,
                head_sent: head_rx.shared(),
                ended: AtomicBool::new(false),
            }),
        };

        let channel = channel.clone();
        let done = Box::pin(async move {
            let result = if http2 {
                channel
                    .write(OutboundMsg::H2Headers {
                        head,
                        stream_id,
                        end_stream: false,
                    })
                    .await
            } else {
                channel
                    .write(OutboundMsg::H1Head { head, body: None })
                    .await
            };
            if result.is_ok() {
                let _ = head_tx.send(());
            }
            result
        });

        WriteOutcome {
            done,
            chunk: Some(chunk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::channel::embedded::EmbeddedChannel;
    use crate::request::HttpRequest;

    #[tokio::test]
    async fn h1_headers_declare_chunked_and_body_follows_writer_calls() {
        let embedded = EmbeddedChannel::new(HttpVersion::H1_1);
        let request = Arc::new(HttpRequest::chunk("http://127.0.0.1/up").build().unwrap());
        let ctx = Arc::new(crate::context::Context::new());

        let outcome = ChunkedWriter.write_and_flush(
            &request,
            &embedded.channel,
            &ctx,
            false,
            HttpVersion::H1_1,
            false,
        );
        let writer = outcome.chunk.unwrap();
        outcome.done.await.unwrap();

        match embedded.read_outbound().unwrap() {
            OutboundMsg::H1Head { head, .. } => {
                assert_eq!(
                    head.headers.get(header::TRANSFER_ENCODING).unwrap(),
                    "chunked"
                );
                assert!(head.headers.get(header::CONTENT_LENGTH).is_none());
            }
            _ => panic!("expected the head"),
        }

        writer.write("abc").await.unwrap();
        writer.end().await.unwrap();
        assert!(writer.write("after end").await.is_err());
        assert!(writer.end().await.is_err());

        match embedded.read_outbound().unwrap() {
            OutboundMsg::H1Data { data, chunked, end } => {
                assert_eq!(&data[..], b"abc");
                assert!(chunked);
                assert!(!end);
            }
            _ => panic!("expected body data"),
        }
        match embedded.read_outbound().unwrap() {
            OutboundMsg::H1Data { data, end, .. } => {
                assert!(data.is_empty());
                assert!(end);
            }
            _ => panic!("expected the terminal chunk"),
        }
    }

    #[tokio::test]
    async fn h2_body_frames_carry_the_stream_id() {
        let embedded = EmbeddedChannel::new(HttpVersion::H2);
        let mut request = HttpRequest::chunk("http://127.0.0.1/up").build().unwrap();
        request
            .headers_mut()
            .insert(crate::proto::handle::STREAM_ID_EXT, "5".parse().unwrap());
        let request = Arc::new(request);
        let ctx = Arc::new(crate::context::Context::new());

        let outcome = ChunkedWriter.write_and_flush(
            &request,
            &embedded.channel,
            &ctx,
            false,
            HttpVersion::H2,
            true,
        );
        let writer = outcome.chunk.unwrap();
        outcome.done.await.unwrap();

        match embedded.read_outbound().unwrap() {
            OutboundMsg::H2Headers {
                stream_id,
                end_stream,
                ..
            } => {
                assert_eq!(stream_id, 5);
                assert!(!end_stream);
            }
            _ => panic!("expected a headers frame"),
        }

        writer.write("xyz").await.unwrap();
        writer.end().await.unwrap();
        match embedded.read_outbound().unwrap() {
            OutboundMsg::H2Data {
                stream_id,
                end_stream,
                data,
            } => {
                assert_eq!(stream_id, 5);
                assert!(!end_stream);
                assert_eq!(&data[..], b"xyz");
            }
            _ => panic!("expected a data frame"),
        }
        match embedded.read_outbound().unwrap() {
            OutboundMsg::H2Data { end_stream, .. } => assert!(end_stream),
            _ => panic!("expected the end-stream frame"),
        }
    }
}
