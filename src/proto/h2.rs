//! HTTP/2 pipeline over the h2 crate.
//!
//! The h2 connection future runs on its own task; requests enter through a
//! cloned `SendRequest` handle. The registry id reserved for the exchange
//! travels in the request's stream-id extension slot and keys both the open
//! send stream and the response-routing task, so read timeouts and
//! connection teardown observe HTTP/2 streams exactly like HTTP/1
//! exchanges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use h2::client::SendRequest;
use h2::SendStream;
use http::header::{self, HeaderMap};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::config::Http2Options;
use crate::proto::channel::{Outbound, OutboundMsg, RequestHead};
use crate::proto::handle::STREAM_ID_EXT;
use crate::proto::registry::HandleRegistry;
use crate::{Error, Result};

type StreamMap = Arc<Mutex<HashMap<u32, SendStream<Bytes>>>>;

/// Outbound half of an HTTP/2 connection.
pub(crate) struct H2Outbound {
    send: SendRequest<Bytes>,
    streams: StreamMap,
    registry: Arc<HandleRegistry>,
    active: Arc<AtomicBool>,
}

/// Performs the h2 preface/settings handshake on `io`, spawns the
/// connection task and returns the outbound seam.
pub(crate) async fn spawn_h2<T>(
    io: T,
    registry: Arc<HandleRegistry>,
    opts: &Http2Options,
    active: Arc<AtomicBool>,
) -> Result<H2Outbound>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = h2::client::Builder::new();
    opts.apply(&mut builder);
    let (send, connection) = builder
        .handshake(io)
        .await
        .map_err(Error::new_handshake)?;

    let conn_active = Arc::clone(&active);
    let conn_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("h2 connection terminated: {}", err);
        }
        conn_active.store(false, Ordering::Release);
        conn_registry.clear_with(Error::new_closed);
    });

    Ok(H2Outbound {
        send,
        streams: Arc::new(Mutex::new(HashMap::new())),
        registry,
        active,
    })
}

impl Outbound for H2Outbound {
    fn write(&self, msg: OutboundMsg) -> BoxFuture<'static, Result<()>> {
        match msg {
            OutboundMsg::H2Headers {
                head,
                stream_id,
                end_stream,
            } => {
                let send = self.send.clone();
                let registry = Arc::clone(&self.registry);
                let streams = Arc::clone(&self.streams);
                Box::pin(async move {
                    let request = into_h2_request(head)?;
                    let mut send = send.ready().await.map_err(Error::new_h2)?;
                    let (response, stream) = send
                        .send_request(request, end_stream)
                        .map_err(Error::new_h2)?;
                    if !end_stream {
                        streams.lock().unwrap().insert(stream_id, stream);
                    }
                    tokio::spawn(route_response(registry, stream_id, response));
                    Ok(())
                })
            }
            OutboundMsg::H2Data {
                stream_id,
                data,
                end_stream,
            } => {
                let streams = Arc::clone(&self.streams);
                Box::pin(async move {
                    let mut stream = streams
                        .lock()
                        .unwrap()
                        .remove(&stream_id)
                        .ok_or_else(Error::new_closed)?;
                    let result = send_data(&mut stream, data, end_stream).await;
                    if result.is_ok() && !end_stream {
                        streams.lock().unwrap().insert(stream_id, stream);
                    }
                    result
                })
            }
            OutboundMsg::Task(task) => {
                task();
                Box::pin(async { Ok(()) })
            }
            OutboundMsg::Shutdown => {
                self.close();
                Box::pin(async { Ok(()) })
            }
            _ => {
                debug_assert!(false, "h1 message on h2 connection");
                Box::pin(async { Err(Error::new_closed()) })
            }
        }
    }

    fn is_writable(&self) -> bool {
        // Backpressure is the business of h2 flow control; the gauge only
        // reflects liveness here.
        self.active.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.streams.lock().unwrap().clear();
    }
}

/// Streams `data` respecting h2 flow-control capacity, ending the stream
/// with the final frame when `end_stream` is set.
async fn send_data(
    stream: &mut SendStream<Bytes>,
    mut data: Bytes,
    end_stream: bool,
) -> Result<()> {
    if data.is_empty() {
        stream
            .send_data(Bytes::new(), end_stream)
            .map_err(Error::new_h2)?;
        return Ok(());
    }
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        match futures_util::future::poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(0)) => continue,
            Some(Ok(capacity)) => {
                let take = capacity.min(data.len());
                let chunk = data.split_to(take);
                let end = end_stream && data.is_empty();
                stream.send_data(chunk, end).map_err(Error::new_h2)?;
            }
            Some(Err(err)) => return Err(Error::new_h2(err)),
            None => return Err(Error::new_closed()),
        }
    }
    Ok(())
}

/// Drives one stream's response back through the registry.
async fn route_response(
    registry: Arc<HandleRegistry>,
    id: u32,
    response: h2::client::ResponseFuture,
) {
    match response.await {
        Ok(rsp) => {
            let (parts, mut body) = rsp.into_parts();
            trace!("h2 stream {} response: {}", id, parts.status);
            registry.with_mut(id, |h| h.on_message(parts.status, parts.headers));
            while let Some(chunk) = body.data().await {
                match chunk {
                    Ok(data) => {
                        let len = data.len();
                        let ok = registry.with_mut(id, |h| h.on_data(data)).unwrap_or(true);
                        let _ = body.flow_control().release_capacity(len);
                        if !ok {
                            if let Some(handle) = registry.remove(id) {
                                handle.fail(Error::new_too_large());
                            }
                            return;
                        }
                    }
                    Err(err) => {
                        if let Some(handle) = registry.remove(id) {
                            handle.fail(Error::new_h2(err));
                        }
                        return;
                    }
                }
            }
            let _ = body.trailers().await;
            if let Some(handle) = registry.remove(id) {
                handle.complete();
            }
        }
        Err(err) => {
            if let Some(handle) = registry.remove(id) {
                handle.fail(Error::new_h2(err));
            }
        }
    }
}

/// Maps a protocol-agnostic head onto an `http::Request` for the h2 layer,
/// moving authority/scheme/path into pseudo-header position and dropping
/// everything that must not appear in HTTP/2 header blocks: the stream-id
/// extension slot, `Host`, and connection-specific headers.
pub(crate) fn into_h2_request(head: RequestHead) -> Result<http::Request<()>> {
    let RequestHead {
        method,
        target,
        scheme,
        authority,
        mut headers,
        ..
    } = head;

    standard_headers(&mut headers);

    let uri = http::Uri::builder()
        .scheme(scheme.as_str())
        .authority(authority.as_str())
        .path_and_query(target.as_str())
        .build()
        .map_err(Error::new_parse)?;

    let mut request = http::Request::builder()
        .method(method)
        .uri(uri)
        .body(())
        .map_err(Error::new_parse)?;
    *request.headers_mut() = headers;
    Ok(request)
}

/// Reduces a header set to what may legally enter an HTTP/2 header block,
/// preserving all other entries.
pub(crate) fn standard_headers(headers: &mut HeaderMap) {
    headers.remove(STREAM_ID_EXT);
    headers.remove(header::HOST);
    headers.remove(header::CONNECTION);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
    headers.remove(header::TE);
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpVersion, Scheme};
    use http::Method;

    #[test]
    fn standard_headers_strips_non_h2_entries() {
        let mut headers = HeaderMap::new();
        headers.insert(STREAM_ID_EXT, "3".parse().unwrap());
        headers.insert(header::HOST, "127.0.0.1".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert("a", "b".parse().unwrap());

        standard_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("a").unwrap(), "b");
    }

    #[test]
    fn h2_request_carries_pseudo_fields() {
        let mut headers = HeaderMap::new();
        headers.insert(STREAM_ID_EXT, "3".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let head = RequestHead {
            method: Method::POST,
            target: "/abc".into(),
            version: HttpVersion::H2,
            scheme: Scheme::Http,
            authority: "127.0.0.1".into(),
            headers,
        };
        let request = into_h2_request(head).unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().authority().unwrap().as_str(), "127.0.0.1");
        assert_eq!(request.uri().path(), "/abc");
        assert!(request.headers().get(STREAM_ID_EXT).is_none());
        assert_eq!(request.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
    }
}
