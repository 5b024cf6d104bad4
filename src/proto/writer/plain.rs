//! Writer for plain requests: headers plus an optional in-memory body.

use std::sync::Arc;

use bytes::Bytes;
use http::header;

use crate::config::HttpVersion;
use crate::context::Context;
use crate::proto::channel::{Channel, OutboundMsg};
use crate::proto::writer::{build_head, continue_gate, stream_id_of, RequestWriter, WriteOutcome};
use crate::request::{Body, HttpRequest};

pub(crate) struct PlainWriter;

impl RequestWriter for PlainWriter {
    fn write_and_flush(
        &self,
        request: &Arc<HttpRequest>,
        channel: &Channel,
        ctx: &Arc<Context>,
        uri_encode: bool,
        version: HttpVersion,
        http2: bool,
    ) -> WriteOutcome {
        let body = match request.body() {
            Body::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        };
        let mut head = build_head(request, version, http2, uri_encode);
        if let Some(bytes) = &body {
            if !head.headers.contains_key(header::CONTENT_LENGTH) {
                head.headers
                    .insert(header::CONTENT_LENGTH, header::HeaderValue::from(bytes.len()));
            }
        }

        let gate = continue_gate(ctx);
        let channel = channel.clone();
        let stream_id = stream_id_of(request);

        let done = Box::pin(async move {
            if http2 {
                let end_stream = body.is_none();
                channel
                    .write(OutboundMsg::H2Headers {
                        head,
                        stream_id,
                        end_stream,
                    })
                    .await?;
                let Some(data) = body else { return Ok(()) };
                if let Some(gate) = gate {
                    if gate.await.is_err() {
                        // Answered without 100-continue; the body is
                        // discarded.
                        return Ok(());
                    }
                }
                channel
                    .write(OutboundMsg::H2Data {
                        stream_id,
                        data,
                        end_stream: true,
                    })
                    .await
            } else if let Some(gate) = gate {
                let data = body.unwrap_or_else(Bytes::new);
                channel
                    .write(OutboundMsg::H1Head { head, body: None })
                    .await?;
                if gate.await.is_err() {
                    return Ok(());
                }
                channel
                    .write(OutboundMsg::H1Data {
                        data,
                        chunked: false,
                        end: false,
                    })
                    .await
            } else {
                // The common case: one write for head and body together.
                channel.write(OutboundMsg::H1Head { head, body }).await
            }
        });

        WriteOutcome { done, chunk: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::channel::embedded::EmbeddedChannel;

    #[tokio::test]
    async fn h1_head_and_body_go_out_in_one_write() {
        let embedded = EmbeddedChannel::new(HttpVersion::H1_1);
        let request = Arc::new(
            HttpRequest::post("http://127.0.0.1/abc")
                .body("hello")
                .build()
                .unwrap(),
        );
        let ctx = Arc::new(Context::new());

        PlainWriter
            .write_and_flush(
                &request,
                &embedded.channel,
                &ctx,
                false,
                HttpVersion::H1_1,
                false,
            )
            .done
            .await
            .unwrap();

        match embedded.read_outbound().unwrap() {
            OutboundMsg::H1Head { head, body } => {
                assert_eq!(head.headers.get(header::HOST).unwrap(), "127.0.0.1");
                assert_eq!(head.headers.get(header::CONTENT_LENGTH).unwrap(), "5");
                assert_eq!(&body.unwrap()[..], b"hello");
            }
            _ => panic!("expected one combined write"),
        }
        assert!(embedded.read_outbound().is_none());
    }

    #[tokio::test]
    async fn h2_bodyless_request_ends_stream_on_headers() {
        let embedded = EmbeddedChannel::new(HttpVersion::H2);
        let request = Arc::new(HttpRequest::get("http://127.0.0.1/abc").build().unwrap());
        let ctx = Arc::new(Context::new());

        PlainWriter
            .write_and_flush(&request, &embedded.channel, &ctx, false, HttpVersion::H2, true)
            .done
            .await
            .unwrap();

        match embedded.read_outbound().unwrap() {
            OutboundMsg::H2Headers { end_stream, .. } => assert!(end_stream),
            _ => panic!("expected a headers frame"),
        }
        assert!(embedded.read_outbound().is_none());
    }
}
