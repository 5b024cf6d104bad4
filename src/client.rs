//! The client facade.
//!
//! [`HttpClient`] assembles the interceptor chain and the transceiver from
//! a [`ClientBuilder`] snapshot. Executing a request spawns the chain onto
//! the runtime and hands back a [`ResponseFuture`] immediately; dropping
//! the future cancels the request.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::builder::ClientBuilder;
use crate::context::Context;
use crate::exec::{ChainCore, Interceptor, Next};
use crate::listener::{Listener, NoopListener};
use crate::proto::connect::Connector;
use crate::proto::pool::ChannelPools;
use crate::proto::transceiver::{Transceiver, TransceiverOptions};
use crate::proto::writer::ChunkWriter;
use crate::request::{HttpRequest, RequestType};
use crate::response::HttpResponse;
use crate::{Error, Result};

/// An asynchronous HTTP/1.x and HTTP/2 client with per-endpoint connection
/// pooling.
///
/// Cheap to clone by wrapping in `Arc`; all handles share the pools.
pub struct HttpClient {
    chain: Arc<[Arc<dyn Interceptor>]>,
    core: Arc<ChainCore>,
    pools: Arc<ChannelPools>,
    closed: AtomicBool,
}

impl HttpClient {
    /// A client with all defaults.
    pub fn of_default() -> HttpClient {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_builder(builder: ClientBuilder) -> HttpClient {
        let connector = Arc::new(Connector::new(
            builder.get_version(),
            builder.is_h2_clear_text_upgrade(),
            builder.get_connect_timeout(),
            (**builder.get_net_options()).clone(),
            (**builder.get_http1_options()).clone(),
            (**builder.get_http2_options()).clone(),
            (**builder.get_ssl_options()).clone(),
        ));
        let pools = Arc::new(ChannelPools::new(
            connector,
            builder.pool_defaults(),
            builder.get_channel_pool_options_provider().cloned(),
        ));
        let opts = Arc::new(TransceiverOptions {
            version: builder.get_version(),
            keep_alive: builder.is_keep_alive(),
            uri_encode: builder.is_uri_encode_enabled(),
            read_timeout: builder.get_read_timeout(),
            max_content_length: builder.get_max_content_length(),
            use_decompress: builder.is_use_decompress(),
            decompression: builder.get_decompression(),
        });
        let transceiver = Arc::new(Transceiver::new(
            Arc::clone(builder.get_resolver()),
            Arc::clone(&pools),
            opts,
        ));
        let core = Arc::new(ChainCore {
            transceiver,
            default_read_timeout: builder.get_read_timeout(),
        });

        HttpClient {
            chain: builder.unmodifiable_interceptors().into(),
            core,
            pools,
            closed: AtomicBool::new(false),
        }
    }

    /// Executes `request` with a no-op listener.
    pub fn execute(&self, request: HttpRequest) -> ResponseFuture {
        self.execute_with(request, NoopListener)
    }

    /// Executes `request`, delivering lifecycle events to `listener`.
    pub fn execute_with(
        &self,
        request: HttpRequest,
        listener: impl Listener + 'static,
    ) -> ResponseFuture {
        let ctx = Arc::new(Context::new());
        let is_chunk = request.request_type() == RequestType::Chunk;
        let (tx, rx) = oneshot::channel();

        if self.closed.load(Ordering::Acquire) {
            let _ = tx.send(Err(Error::new_closed()));
            return ResponseFuture {
                rx,
                ctx,
                is_chunk,
                join: None,
                done: false,
            };
        }

        let chain = Arc::clone(&self.chain);
        let core = Arc::clone(&self.core);
        let listener: Arc<dyn Listener> = Arc::new(listener);
        let task_ctx = Arc::clone(&ctx);
        let join = tokio::spawn(async move {
            let next = Next {
                rest: &chain[..],
                core: &core,
                ctx: &task_ctx,
                listener: &listener,
            };
            let result = next.proceed(request).await;
            let _ = tx.send(result);
        });

        ResponseFuture {
            rx,
            ctx,
            is_chunk,
            join: Some(join),
            done: false,
        }
    }

    /// Shuts the client down: pending pool waiters fail and pooled
    /// connections are dropped. In-flight exchanges run to completion on
    /// their own tasks.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.pools.close();
        }
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// A pending response.
///
/// Dropping the future before completion cancels the request: its registry
/// entry is removed, the read-timeout token cancelled, and an HTTP/1
/// connection is closed instead of returning to its pool.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<HttpResponse>>,
    ctx: Arc<Context>,
    is_chunk: bool,
    join: Option<JoinHandle<()>>,
    done: bool,
}

impl ResponseFuture {
    /// Resolves to the [`ChunkWriter`] of a chunked request once the
    /// request has been dispatched onto a connection.
    ///
    /// Await this before awaiting the response itself:
    ///
    /// ```ignore
    /// let rsp = client.execute(HttpRequest::chunk("http://host/up").build()?);
    /// let writer = rsp.chunk_writer().await?;
    /// writer.write("part 1").await?;
    /// writer.end().await?;
    /// let rsp = rsp.await?;
    /// ```
    pub async fn chunk_writer(&self) -> Result<ChunkWriter> {
        if !self.is_chunk {
            return Err(Error::new_write("not a chunk request"));
        }
        loop {
            let installed = self.ctx.chunk_installed();
            if let Some(fut) = self.ctx.chunk_writer() {
                return fut.await.map_err(|_| Error::new_canceled());
            }
            installed.await;
        }
    }

    /// The request context, as seen by interceptors and filters.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl Future for ResponseFuture {
    type Output = Result<HttpResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.done = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                self.done = true;
                Poll::Ready(Err(Error::new_canceled()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Abort the chain task; the transceiver's dispatch future unwinds
        // registry entry, timeout token and connection on its way down.
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpVersion;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_request_head(sock: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed before the request head ended");
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                return buf;
            }
        }
    }

    #[tokio::test]
    async fn http1_get_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let head = read_request_head(&mut sock).await;
            let text = String::from_utf8_lossy(&head);
            assert!(text.starts_with("GET /abc HTTP/1.1\r\n"));
            assert!(text.to_ascii_lowercase().contains("host: 127.0.0.1"));
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });

        let client = HttpClient::of_default();
        let request = HttpRequest::get(&format!("http://127.0.0.1:{}/abc", addr.port()))
            .build()
            .unwrap();
        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.version(), HttpVersion::H1_1);
        assert_eq!(&response.body()[..], b"hello");
    }

    #[tokio::test]
    async fn http1_keep_alive_reuses_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let server_accepts = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                server_accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    loop {
                        read_request_head(&mut sock).await;
                        sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                            .await
                            .unwrap();
                    }
                });
            }
        });

        let client = HttpClient::of_default();
        let uri = format!("http://127.0.0.1:{}/", addr.port());
        for _ in 0..2 {
            let response = client
                .execute(HttpRequest::get(&uri).build().unwrap())
                .await
                .unwrap();
            assert_eq!(&response.body()[..], b"ok");
        }
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http1_post_sends_the_body() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = read_request_head(&mut sock).await;
            let text = String::from_utf8_lossy(&received).to_ascii_lowercase();
            assert!(text.contains("content-length: 7"));

            // The body may trail the head in a later segment.
            let head_end = received
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .unwrap()
                + 4;
            let mut missing = 7 - (received.len() - head_end);
            while missing > 0 {
                let mut rest = vec![0u8; missing];
                let n = sock.read(&mut rest).await.unwrap();
                received.extend_from_slice(&rest[..n]);
                missing -= n;
            }
            assert!(received.ends_with(b"payload"));
            sock.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        });

        let client = HttpClient::of_default();
        let request = HttpRequest::post(&format!("http://127.0.0.1:{}/submit", addr.port()))
            .body("payload")
            .build()
            .unwrap();
        let response = client.execute(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn silent_server_trips_the_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_request_head(&mut sock).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(sock);
        });

        let client = HttpClient::of_default();
        let request = HttpRequest::get(&format!("http://127.0.0.1:{}/", addr.port()))
            .read_timeout(Duration::from_millis(150))
            .build()
            .unwrap();
        let err = client.execute(request).await.unwrap_err();
        assert!(err.is_read_timeout(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    async fn saturated_pool_rejects_the_overflow_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                held.push(sock);
            }
        });

        let client = HttpClient::builder()
            .connection_pool_size(1)
            .connection_pool_waiting_queue_length(0)
            .retry_options(None)
            .build();
        let uri = format!("http://127.0.0.1:{}/", addr.port());

        let parked = client.execute(
            HttpRequest::get(&uri)
                .read_timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = client
            .execute(HttpRequest::get(&uri).build().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_pool_exhausted(), "unexpected error: {:?}", err);
        drop(parked);
    }

    #[tokio::test]
    async fn chunked_request_streams_through_the_writer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 1024];
            // Read until the terminal chunk arrives.
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                received.extend_from_slice(&chunk[..n]);
                if received.windows(5).any(|w| w == b"0\r\n\r\n") {
                    break;
                }
            }
            let text = String::from_utf8_lossy(&received).to_ascii_lowercase();
            assert!(text.contains("transfer-encoding: chunked"));
            assert!(text.contains("part one"));
            assert!(text.contains("part two"));
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let client = HttpClient::of_default();
        let request = HttpRequest::chunk(&format!("http://127.0.0.1:{}/up", addr.port()))
            .build()
            .unwrap();
        let pending = client.execute(request);
        let writer = pending.chunk_writer().await.unwrap();
        writer.write("part one").await.unwrap();
        writer.write("part two").await.unwrap();
        writer.end().await.unwrap();

        let response = pending.await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn h2c_roundtrip_over_prior_knowledge() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let server_accepts = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                server_accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut conn = h2::server::handshake(sock).await.unwrap();
                    while let Some(result) = conn.accept().await {
                        let (request, mut respond) = result.unwrap();
                        assert_eq!(request.method(), http::Method::GET);
                        let response = http::Response::builder()
                            .status(http::StatusCode::OK)
                            .body(())
                            .unwrap();
                        let mut send = respond.send_response(response, false).unwrap();
                        send.send_data(bytes::Bytes::from_static(b"hi"), true)
                            .unwrap();
                    }
                });
            }
        });

        let client = HttpClient::builder()
            .version(HttpVersion::H2)
            .h2_clear_text_upgrade(true)
            .build();
        let uri = format!("http://127.0.0.1:{}/", addr.port());

        // Two concurrent requests multiplex onto the one connection.
        let (a, b) = tokio::join!(
            client.execute(HttpRequest::get(&uri).build().unwrap()),
            client.execute(HttpRequest::get(&uri).build().unwrap()),
        );
        assert_eq!(&a.unwrap().body()[..], b"hi");
        assert_eq!(&b.unwrap().body()[..], b"hi");
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_client_rejects_new_requests() {
        let client = HttpClient::of_default();
        client.close();
        let err = client
            .execute(HttpRequest::get("http://127.0.0.1:1/").build().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }
}
