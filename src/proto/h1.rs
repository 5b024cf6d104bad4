//! HTTP/1 pipeline: wire encoding, response decoding and the connection
//! tasks.
//!
//! A connection owns two tasks bound to its transport halves. The write
//! task drains the outbound op queue, encodes messages and completes their
//! write signals once the bytes are flushed into the socket buffer. The
//! read task parses responses and drives the single registry entry (id 1)
//! of the in-flight exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::config::{Http1Options, HttpVersion};
use crate::proto::channel::{wait, Outbound, OutboundMsg, RequestHead, WriteGauge};
use crate::proto::registry::HandleRegistry;
use crate::{Error, Result};

const H1_REQUEST_ID: u32 = 1;

// ===== encoding =====

pub(crate) fn encode_head(head: &RequestHead, dst: &mut BytesMut) {
    dst.put_slice(head.method.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(head.target.as_bytes());
    match head.version {
        HttpVersion::H1_0 => dst.put_slice(b" HTTP/1.0\r\n"),
        _ => dst.put_slice(b" HTTP/1.1\r\n"),
    }
    for (name, value) in head.headers.iter() {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

pub(crate) fn encode_chunk(data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    dst.put_slice(format!("{:X}\r\n", data.len()).as_bytes());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

pub(crate) fn encode_last_chunk(dst: &mut BytesMut) {
    dst.put_slice(b"0\r\n\r\n");
}

// ===== outbound half =====

struct Op {
    msg: OutboundMsg,
    done: oneshot::Sender<Result<()>>,
}

/// Sender half handed to writers; the write task drains the other end.
pub(crate) struct H1Outbound {
    ops: mpsc::UnboundedSender<Op>,
    gauge: Arc<WriteGauge>,
    active: Arc<AtomicBool>,
}

impl Outbound for H1Outbound {
    fn write(&self, msg: OutboundMsg) -> BoxFuture<'static, Result<()>> {
        let size = msg.size_hint();
        self.gauge.add(size);
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op { msg, done: tx }).is_err() {
            self.gauge.sub(size);
            return Box::pin(async { Err(Error::new_closed()) });
        }
        Box::pin(wait(rx))
    }

    fn is_writable(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.gauge.is_writable()
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
        let (tx, _rx) = oneshot::channel();
        let _ = self.ops.send(Op {
            msg: OutboundMsg::Shutdown,
            done: tx,
        });
    }
}

/// Installs the HTTP/1 handlers on a fresh transport and returns the
/// outbound seam. `version` is what the request line will carry.
pub(crate) fn spawn_h1<T>(
    io: T,
    registry: Arc<HandleRegistry>,
    opts: Http1Options,
    gauge: Arc<WriteGauge>,
    active: Arc<AtomicBool>,
) -> H1Outbound
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(io);
    let (ops_tx, ops_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_task(
        wr,
        ops_rx,
        Arc::clone(&gauge),
        Arc::clone(&active),
        Arc::clone(&registry),
    ));
    tokio::spawn(read_task(
        rd,
        Arc::clone(&registry),
        opts,
        Arc::clone(&active),
        ops_tx.clone(),
    ));

    H1Outbound {
        ops: ops_tx,
        gauge,
        active,
    }
}

async fn write_task<W>(
    mut wr: tokio::io::WriteHalf<W>,
    mut ops: mpsc::UnboundedReceiver<Op>,
    gauge: Arc<WriteGauge>,
    active: Arc<AtomicBool>,
    registry: Arc<HandleRegistry>,
) where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(op) = ops.recv().await {
        let size = op.msg.size_hint();
        buf.clear();
        match op.msg {
            OutboundMsg::H1Head { head, body } => {
                encode_head(&head, &mut buf);
                if let Some(body) = body {
                    buf.put_slice(&body);
                }
            }
            OutboundMsg::H1Data { data, chunked, end } => {
                if chunked {
                    encode_chunk(&data, &mut buf);
                    if end {
                        encode_last_chunk(&mut buf);
                    }
                } else {
                    buf.put_slice(&data);
                }
            }
            OutboundMsg::Task(task) => {
                task();
                gauge.sub(size);
                let _ = op.done.send(Ok(()));
                continue;
            }
            OutboundMsg::Shutdown => {
                let _ = wr.shutdown().await;
                let _ = op.done.send(Ok(()));
                break;
            }
            other => {
                // An h2 message reached an h1 pipeline: a writer bug.
                debug_assert!(false, "h2 message on h1 connection");
                drop(other);
                gauge.sub(size);
                let _ = op.done.send(Err(Error::new_closed()));
                continue;
            }
        }

        let result = async {
            wr.write_all(&buf).await?;
            wr.flush().await
        }
        .await;
        gauge.sub(size);

        match result {
            Ok(()) => {
                let _ = op.done.send(Ok(()));
            }
            Err(err) => {
                debug!("h1 write failed: {}", err);
                active.store(false, Ordering::Release);
                let _ = op.done.send(Err(Error::new_write(err)));
                break;
            }
        }
    }

    // Fail whatever is still queued; the connection is done writing.
    active.store(false, Ordering::Release);
    ops.close();
    while let Ok(op) = ops.try_recv() {
        let _ = op.done.send(Err(Error::new_closed()));
    }
    registry.clear_with(Error::new_closed);
}

// ===== inbound half =====

enum DecodeState {
    Head,
    FixedBody(u64),
    ChunkedSize,
    ChunkedData(u64),
    ChunkedDataEnd,
    ChunkedTrailer,
    UntilEof,
}

async fn read_task<R>(
    mut rd: tokio::io::ReadHalf<R>,
    registry: Arc<HandleRegistry>,
    opts: Http1Options,
    active: Arc<AtomicBool>,
    ops: mpsc::UnboundedSender<Op>,
) where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut state = DecodeState::Head;
    let mut keep_alive = true;

    'conn: loop {
        match decode(&mut buf, &mut state, &mut keep_alive, &registry, &opts) {
            Ok(true) => {
                if !keep_alive {
                    break 'conn;
                }
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                fail_inflight(&registry, err);
                break 'conn;
            }
        }

        match rd.read_buf(&mut buf).await {
            Ok(0) => {
                // EOF completes a read-to-eof body; anything else pending
                // died with the connection.
                if matches!(state, DecodeState::UntilEof) {
                    if let Some(handle) = registry.remove(H1_REQUEST_ID) {
                        handle.complete();
                    }
                }
                break 'conn;
            }
            Ok(_) => {}
            Err(err) => {
                trace!("h1 read failed: {}", err);
                break 'conn;
            }
        }
    }

    active.store(false, Ordering::Release);
    registry.clear_with(Error::new_closed);
    let (tx, _rx) = oneshot::channel();
    let _ = ops.send(Op {
        msg: OutboundMsg::Shutdown,
        done: tx,
    });
}

fn fail_inflight(registry: &HandleRegistry, err: Error) {
    if let Some(handle) = registry.remove(H1_REQUEST_ID) {
        handle.fail(err);
    } else {
        registry.clear_with(Error::new_closed);
    }
}

/// Decodes as much of `buf` as possible. Returns `Ok(true)` when a message
/// completed, `Ok(false)` when more input is needed.
fn decode(
    buf: &mut BytesMut,
    state: &mut DecodeState,
    keep_alive: &mut bool,
    registry: &HandleRegistry,
    opts: &Http1Options,
) -> Result<bool> {
    loop {
        match state {
            DecodeState::Head => {
                let mut headers = [httparse::EMPTY_HEADER; 64];
                let mut parsed = httparse::Response::new(&mut headers);
                match parsed.parse(&buf[..]).map_err(Error::new_parse)? {
                    httparse::Status::Partial => {
                        if buf.len() > opts.header_size_limit() {
                            return Err(Error::new_parse("response head too large"));
                        }
                        return Ok(false);
                    }
                    httparse::Status::Complete(len) => {
                        let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                            .map_err(Error::new_parse)?;
                        let minor = parsed.version.unwrap_or(1);
                        let mut map = HeaderMap::with_capacity(parsed.headers.len());
                        for header in parsed.headers.iter() {
                            let name = HeaderName::from_bytes(header.name.as_bytes())
                                .map_err(Error::new_parse)?;
                            let value = HeaderValue::from_bytes(header.value)
                                .map_err(Error::new_parse)?;
                            map.append(name, value);
                        }
                        buf.advance(len);

                        if status == StatusCode::CONTINUE {
                            // Interim response: resume the withheld body and
                            // keep waiting for the real one.
                            registry.with_mut(H1_REQUEST_ID, |h| h.on_continue());
                            continue;
                        }
                        if status.is_informational() {
                            continue;
                        }

                        *keep_alive = message_keep_alive(minor, &map);
                        let body = body_kind(status, &map, registry)?;
                        registry.with_mut(H1_REQUEST_ID, |h| {
                            h.on_message(status, map);
                        });
                        *state = body;
                        if matches!(state, DecodeState::Head) {
                            return finish_message(registry);
                        }
                    }
                }
            }
            DecodeState::FixedBody(remaining) => {
                if buf.is_empty() {
                    return Ok(false);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                let data = buf.split_to(take).freeze();
                *remaining -= take as u64;
                deliver_data(registry, data)?;
                if *remaining == 0 {
                    *state = DecodeState::Head;
                    return finish_message(registry);
                }
            }
            DecodeState::ChunkedSize => {
                let Some(line_end) = find_crlf(buf) else {
                    if buf.len() > opts.chunk_size_limit() + 16 {
                        return Err(Error::new_parse("chunk size line too long"));
                    }
                    return Ok(false);
                };
                let line = buf.split_to(line_end + 2);
                let size_str = std::str::from_utf8(&line[..line_end])
                    .map_err(Error::new_parse)?
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim();
                let size = u64::from_str_radix(size_str, 16).map_err(Error::new_parse)?;
                *state = if size == 0 {
                    DecodeState::ChunkedTrailer
                } else {
                    DecodeState::ChunkedData(size)
                };
            }
            DecodeState::ChunkedData(remaining) => {
                if buf.is_empty() {
                    return Ok(false);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                let data = buf.split_to(take).freeze();
                *remaining -= take as u64;
                deliver_data(registry, data)?;
                if *remaining == 0 {
                    *state = DecodeState::ChunkedDataEnd;
                }
            }
            DecodeState::ChunkedDataEnd => {
                if buf.len() < 2 {
                    return Ok(false);
                }
                let crlf = buf.split_to(2);
                if &crlf[..] != b"\r\n" {
                    return Err(Error::new_parse("malformed chunk terminator"));
                }
                *state = DecodeState::ChunkedSize;
            }
            DecodeState::ChunkedTrailer => {
                let Some(line_end) = find_crlf(buf) else {
                    return Ok(false);
                };
                let line = buf.split_to(line_end + 2);
                if line_end == 0 {
                    *state = DecodeState::Head;
                    return finish_message(registry);
                }
                drop(line);
            }
            DecodeState::UntilEof => {
                if buf.is_empty() {
                    return Ok(false);
                }
                let data = buf.split().freeze();
                deliver_data(registry, data)?;
            }
        }
    }
}

fn deliver_data(registry: &HandleRegistry, data: Bytes) -> Result<()> {
    let ok = registry
        .with_mut(H1_REQUEST_ID, |h| h.on_data(data))
        .unwrap_or(true);
    if ok {
        Ok(())
    } else {
        if let Some(handle) = registry.remove(H1_REQUEST_ID) {
            handle.fail(Error::new_too_large());
        }
        Err(Error::new_too_large())
    }
}

fn finish_message(registry: &HandleRegistry) -> Result<bool> {
    if let Some(handle) = registry.remove(H1_REQUEST_ID) {
        handle.complete();
    }
    Ok(true)
}

fn body_kind(
    status: StatusCode,
    headers: &HeaderMap,
    registry: &HandleRegistry,
) -> Result<DecodeState> {
    let head_request = registry
        .with_mut(H1_REQUEST_ID, |h| h.is_head_request())
        .unwrap_or(false);
    if head_request
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(DecodeState::Head);
    }
    if let Some(te) = headers.get(TRANSFER_ENCODING) {
        if te
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false)
        {
            return Ok(DecodeState::ChunkedSize);
        }
    }
    if let Some(len) = headers.get(CONTENT_LENGTH) {
        let len: u64 = len
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::new_parse("invalid content-length"))?;
        return Ok(if len == 0 {
            DecodeState::Head
        } else {
            DecodeState::FixedBody(len)
        });
    }
    Ok(DecodeState::UntilEof)
}

fn message_keep_alive(minor: u8, headers: &HeaderMap) -> bool {
    if let Some(conn) = headers.get(CONNECTION) {
        if connection_has(conn, "close") {
            return false;
        }
        if connection_has(conn, "keep-alive") {
            return true;
        }
    }
    minor != 0
}

fn connection_has(value: &HeaderValue, needle: &str) -> bool {
    if let Ok(s) = value.to_str() {
        for val in s.split(',') {
            if val.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scheme;

    fn head(version: HttpVersion) -> RequestHead {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "127.0.0.1".parse().unwrap());
        RequestHead {
            method: http::Method::POST,
            target: "/abc".into(),
            version,
            scheme: Scheme::Http,
            authority: "127.0.0.1".into(),
            headers,
        }
    }

    #[test]
    fn head_encoding_carries_version_and_headers() {
        let mut buf = BytesMut::new();
        encode_head(&head(HttpVersion::H1_1), &mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("POST /abc HTTP/1.1\r\n"));
        assert!(text.contains("host: 127.0.0.1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let mut buf = BytesMut::new();
        encode_head(&head(HttpVersion::H1_0), &mut buf);
        assert!(buf.starts_with(b"POST /abc HTTP/1.0\r\n"));
    }

    #[test]
    fn chunk_encoding_frames_and_terminates() {
        let mut buf = BytesMut::new();
        encode_chunk(b"hello", &mut buf);
        assert_eq!(&buf[..], b"5\r\nhello\r\n");
        let mut buf = BytesMut::new();
        encode_last_chunk(&mut buf);
        assert_eq!(&buf[..], b"0\r\n\r\n");
    }

    #[test]
    fn keep_alive_follows_connection_header() {
        let mut headers = HeaderMap::new();
        assert!(message_keep_alive(1, &headers));
        assert!(!message_keep_alive(0, &headers));
        headers.insert(CONNECTION, "close".parse().unwrap());
        assert!(!message_keep_alive(1, &headers));
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        assert!(message_keep_alive(0, &headers));
    }
}
