//! Writer streaming a request body from disk.

use std::sync::Arc;

use bytes::BytesMut;
use http::header;
use tokio::io::AsyncReadExt;

use crate::config::HttpVersion;
use crate::context::Context;
use crate::proto::channel::{Channel, OutboundMsg};
use crate::proto::writer::{
    build_head, continue_gate, stream_id_of, RequestWriter, WriteOutcome, SEGMENT,
};
use crate::request::{Body, HttpRequest};
use crate::Error;

pub(crate) struct FileWriter;

impl RequestWriter for FileWriter {
    fn write_and_flush(
        &self,
        request: &Arc<HttpRequest>,
        channel: &Channel,
        ctx: &Arc<Context>,
        uri_encode: bool,
        version: HttpVersion,
        http2: bool,
    ) -> WriteOutcome {
        let path = match request.body() {
            Body::File(path) => path.clone(),
            _ => {
                return WriteOutcome {
                    done: Box::pin(async {
                        Err(Error::new_write("file writer without file body"))
                    }),
                    chunk: None,
                }
            }
        };

        let head = build_head(request, version, http2, uri_encode);
        let gate = continue_gate(ctx);
        let channel = channel.clone();
        let stream_id = stream_id_of(request);

        let done = Box::pin(async move {
            // The file is opened and sized before anything is flushed, so a
            // vanished file fails the write without touching the transport.
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(Error::new_encoding)?;
            let len = file
                .metadata()
                .await
                .map_err(Error::new_encoding)?
                .len();

            let mut head = head;
            head.headers
                .insert(header::CONTENT_LENGTH, header::HeaderValue::from(len));

            if http2 {
                channel
                    .write(OutboundMsg::H2Headers {
                        head,
                        stream_id,
                        end_stream: len == 0,
                    })
                    .await?;
            } else {
                channel
                    .write(OutboundMsg::H1Head { head, body: None })
                    .await?;
            }

            if let Some(gate) = gate {
                if gate.await.is_err() {
                    return Ok(());
                }
            }

            let mut sent: u64 = 0;
            loop {
                let mut buf = BytesMut::with_capacity(SEGMENT);
                let n = file.read_buf(&mut buf).await.map_err(Error::new_encoding)?;
                if n == 0 {
                    break;
                }
                sent += n as u64;
                let last = sent >= len;
                if http2 {
                    channel
                        .write(OutboundMsg::H2Data {
                            stream_id,
                            data: buf.freeze(),
                            end_stream: last,
                        })
                        .await?;
                } else {
                    channel
                        .write(OutboundMsg::H1Data {
                            data: buf.freeze(),
                            chunked: false,
                            end: false,
                        })
                        .await?;
                }
                if last {
                    break;
                }
            }
            if sent < len {
                // Source shrank mid-stream: the declared length can no
                // longer be honored.
                return Err(Error::new_encoding(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file truncated while streaming",
                )));
            }
            Ok(())
        });

        WriteOutcome { done, chunk: None }
    }
}
