//! Writer for multipart/form-data and form-urlencoded requests.
//!
//! Multipart bodies are RFC 7578 boundary-delimited and sent with chunked
//! transfer encoding on HTTP/1; file parts stream from disk in 8 KiB
//! segments. With multipart encoding switched off, the attributes are
//! emitted as one `application/x-www-form-urlencoded` payload.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::header;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::AsyncReadExt;

use crate::config::HttpVersion;
use crate::context::Context;
use crate::proto::channel::{Channel, OutboundMsg, RequestHead};
use crate::proto::writer::{
    build_head, continue_gate, stream_id_of, RequestWriter, WriteOutcome, SEGMENT,
};
use crate::request::{Body, HttpRequest, MultipartBody, Part};
use crate::{Error, Result};

pub(crate) struct MultipartWriter;

impl RequestWriter for MultipartWriter {
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
            Body::Multipart(body) => body.clone(),
            _ => {
                return WriteOutcome {
                    done: Box::pin(async {
                        Err(Error::new_write("multipart writer without multipart body"))
                    }),
                    chunk: None,
                }
            }
        };

        let head = build_head(request, version, http2, uri_encode);
        let gate_ctx = Arc::clone(ctx);
        let channel = channel.clone();
        let stream_id = stream_id_of(request);

        let done: futures_util::future::BoxFuture<'static, Result<()>> = if body.multipart_encode
        {
            Box::pin(async move {
                write_multipart(channel, head, body, &gate_ctx, stream_id, http2).await
            })
        } else {
            Box::pin(async move {
                write_form_urlencoded(channel, head, body, &gate_ctx, stream_id, http2).await
            })
        };

        WriteOutcome { done, chunk: None }
    }
}

async fn write_form_urlencoded(
    channel: Channel,
    mut head: RequestHead,
    body: MultipartBody,
    ctx: &Context,
    stream_id: u32,
    http2: bool,
) -> Result<()> {
    let content = {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (name, value) in &body.attrs {
            serializer.append_pair(name, value);
        }
        Bytes::from(serializer.finish())
    };

    head.headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    head.headers
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from(content.len()));

    let gate = continue_gate(ctx);
    if http2 {
        channel
            .write(OutboundMsg::H2Headers {
                head,
                stream_id,
                end_stream: false,
            })
            .await?;
        if let Some(gate) = gate {
            if gate.await.is_err() {
                return Ok(());
            }
        }
        channel
            .write(OutboundMsg::H2Data {
                stream_id,
                data: content,
                end_stream: true,
            })
            .await
    } else {
        channel
            .write(OutboundMsg::H1Head { head, body: None })
            .await?;
        if let Some(gate) = gate {
            if gate.await.is_err() {
                return Ok(());
            }
        }
        // The terminal content write carries the whole payload.
        channel
            .write(OutboundMsg::H1Data {
                data: content,
                chunked: false,
                end: true,
            })
            .await
    }
}

async fn write_multipart(
    channel: Channel,
    mut head: RequestHead,
    body: MultipartBody,
    ctx: &Context,
    stream_id: u32,
    http2: bool,
) -> Result<()> {
    // Open every file part up front: an encoding error must fail the write
    // before any byte, headers included, reaches the transport.
    let mut files = Vec::with_capacity(body.parts.len());
    for part in &body.parts {
        let file = tokio::fs::File::open(&part.file)
            .await
            .map_err(Error::new_encoding)?;
        files.push(file);
    }

    let boundary = generate_boundary();
    let content_type = format!("multipart/form-data; boundary={}", boundary);
    head.headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_str(&content_type).map_err(Error::new_parse)?,
    );
    if !http2 {
        head.headers.remove(header::CONTENT_LENGTH);
        head.headers.insert(
            header::TRANSFER_ENCODING,
            header::HeaderValue::from_static("chunked"),
        );
    }

    let gate = continue_gate(ctx);
    if http2 {
        channel
            .write(OutboundMsg::H2Headers {
                head,
                stream_id,
                end_stream: false,
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

    let write_data = |data: Bytes, end: bool| {
        let channel = channel.clone();
        async move {
            if http2 {
                channel
                    .write(OutboundMsg::H2Data {
                        stream_id,
                        data,
                        end_stream: end,
                    })
                    .await
            } else {
                channel
                    .write(OutboundMsg::H1Data {
                        data,
                        chunked: true,
                        end,
                    })
                    .await
            }
        }
    };

    for (name, value) in &body.attrs {
        write_data(encode_attribute(&boundary, name, value), false).await?;
    }

    for (part, mut file) in body.parts.iter().zip(files) {
        write_data(encode_part_head(&boundary, part), false).await?;
        loop {
            let mut buf = BytesMut::with_capacity(SEGMENT);
            let n = file.read_buf(&mut buf).await.map_err(Error::new_encoding)?;
            if n == 0 {
                break;
            }
            write_data(buf.freeze(), false).await?;
        }
        write_data(Bytes::from_static(b"\r\n"), false).await?;
    }

    let closing = Bytes::from(format!("--{}--\r\n", boundary));
    write_data(closing, true).await
}

fn encode_attribute(boundary: &str, name: &str, value: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("--{}\r\n", boundary).as_bytes());
    buf.put_slice(
        format!("content-disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
    );
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
    buf.freeze()
}

fn encode_part_head(boundary: &str, part: &Part) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("--{}\r\n", boundary).as_bytes());
    buf.put_slice(
        format!(
            "content-disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            part.name, part.filename
        )
        .as_bytes(),
    );
    match &part.content_type {
        Some(value) => {
            buf.put_slice(b"content-type: ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        None => {
            buf.put_slice(b"content-type: application/octet-stream\r\n");
        }
    }
    if part.text {
        buf.put_slice(b"content-transfer-encoding: 8bit\r\n");
    } else {
        buf.put_slice(b"content-transfer-encoding: binary\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

fn generate_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    format!("courier{}", suffix)
}
