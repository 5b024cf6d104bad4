//! The transceiver: one request's journey from resolved address to
//! completed response future.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use http::header::CONNECTION;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::{Decompression, HttpVersion};
use crate::context::Context;
use crate::error::Kind;
use crate::listener::Listener;
use crate::proto::channel::Channel;
use crate::proto::handle::{ResponseHandle, TransceiverHandle};
use crate::proto::pool::{ChannelPools, Endpoint};
use crate::proto::registry::HandleRegistry;
use crate::proto::timer;
use crate::proto::writer::{self, ChunkWriter};
use crate::request::{HttpRequest, RequestType};
use crate::resolver::{HostResolver, ServerSelector};
use crate::response::HttpResponse;
use crate::{Error, Result};

/// Builder-wide settings the transceiver consults per request.
pub(crate) struct TransceiverOptions {
    pub(crate) version: HttpVersion,
    pub(crate) keep_alive: bool,
    pub(crate) uri_encode: bool,
    pub(crate) read_timeout: Duration,
    pub(crate) max_content_length: u64,
    pub(crate) use_decompress: bool,
    pub(crate) decompression: Decompression,
}

pub(crate) struct Transceiver {
    resolver: Arc<dyn HostResolver>,
    pools: Arc<ChannelPools>,
    opts: Arc<TransceiverOptions>,
}

impl Transceiver {
    pub(crate) fn new(
        resolver: Arc<dyn HostResolver>,
        pools: Arc<ChannelPools>,
        opts: Arc<TransceiverOptions>,
    ) -> Transceiver {
        Transceiver {
            resolver,
            pools,
            opts,
        }
    }

    pub(crate) fn pools(&self) -> &Arc<ChannelPools> {
        &self.pools
    }

    /// Dispatches `request`, returning the response future immediately.
    pub(crate) fn handle(
        &self,
        request: HttpRequest,
        ctx: Arc<Context>,
        listener: Box<dyn Listener>,
        read_timeout: Duration,
    ) -> DispatchFuture {
        listener.on_filters_end(&request, &ctx);

        // The chunk-writer promise is published before any pool work so
        // interceptors and the caller can grab it right away.
        let chunk_tx = if request.request_type() == RequestType::Chunk {
            let (tx, rx) = futures_channel::oneshot::channel::<ChunkWriter>();
            ctx.set_chunk_writer(rx.shared());
            Some(tx)
        } else {
            None
        };

        let (rsp_tx, rsp_rx) = oneshot::channel();
        let cancel = Arc::new(CancelState::new());

        let driver = Driver {
            resolver: Arc::clone(&self.resolver),
            pools: Arc::clone(&self.pools),
            opts: Arc::clone(&self.opts),
            cancel: Arc::clone(&cancel),
        };
        tokio::spawn(driver.run(request, ctx, listener, read_timeout, rsp_tx, chunk_tx));

        DispatchFuture {
            rx: rsp_rx,
            cancel,
        }
    }
}

struct Driver {
    resolver: Arc<dyn HostResolver>,
    pools: Arc<ChannelPools>,
    opts: Arc<TransceiverOptions>,
    cancel: Arc<CancelState>,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    async fn run(
        self,
        mut request: HttpRequest,
        ctx: Arc<Context>,
        listener: Box<dyn Listener>,
        read_timeout: Duration,
        rsp_tx: oneshot::Sender<Result<HttpResponse>>,
        mut chunk_tx: Option<futures_channel::oneshot::Sender<ChunkWriter>>,
    ) {
        let opts = &self.opts;

        let addr = match ServerSelector::select(&*self.resolver, &request, &ctx).await {
            Ok(addr) => addr,
            Err(err) => {
                let _ = rsp_tx.send(Err(end_with(&*listener, &request, &ctx, err)));
                return;
            }
        };

        listener.on_connection_pool_attempt(&request, &ctx, addr);
        let endpoint = Endpoint {
            scheme: request.scheme(),
            host: request.host().to_owned(),
            port: request.port(),
        };
        let pool = self.pools.get_or_create(endpoint);
        listener.on_connection_pool_acquired(&request, &ctx, addr);

        listener.on_connection_attempt(&request, &ctx, addr);
        let writer = writer::get_by_type(request.request_type());

        let channel = match pool.acquire(addr).await {
            Ok(channel) => channel,
            Err(err) => {
                let err = normalize_acquire(err);
                listener.on_acquire_connection_failed(&request, &ctx, addr, &err);
                listener.on_error(&request, &ctx, &err);
                let _ = rsp_tx.send(Err(err));
                return;
            }
        };
        listener.on_connection_acquired(&request, &ctx, addr);

        // Revalidate what the pool handed out: the handshake has completed
        // by construction, but the connection may have died since, and a
        // saturated outbound buffer must not take more writes.
        if !channel.is_active() {
            channel.close();
            pool.release(channel.clone());
            let _ = rsp_tx.send(Err(end_with(
                &*listener,
                &request,
                &ctx,
                Error::new_connection_inactive(),
            )));
            return;
        }
        if !channel.is_writable() {
            pool.release(channel.clone());
            let _ = rsp_tx.send(Err(end_with(
                &*listener,
                &request,
                &ctx,
                Error::new_write_buffer_full(),
            )));
            return;
        }

        let http2 = channel.is_http2();
        let version = if http2 {
            HttpVersion::H2
        } else if opts.version == HttpVersion::H1_0 {
            HttpVersion::H1_0
        } else {
            HttpVersion::H1_1
        };

        set_keep_alive(&mut request, version, opts.version, opts.keep_alive);
        if opts.use_decompress && !request.headers().contains_key(http::header::ACCEPT_ENCODING) {
            request.headers_mut().insert(
                http::header::ACCEPT_ENCODING,
                http::HeaderValue::from_static(opts.decompression.accept_encoding()),
            );
        }

        let strategy = TransceiverHandle::for_channel(&channel);
        let registry = Arc::clone(channel.registry());
        let id = strategy.reserve_id(&mut request, &registry);

        let request = Arc::new(request);
        let th = strategy.build_timeout_handle(
            channel.clone(),
            Arc::clone(&pool),
            listener,
            Arc::clone(&request),
            Arc::clone(&ctx),
        );
        th.on_write_attempt();

        // The handle goes in before the write: on a multiplexed connection
        // the response may race the tail of our own request.
        let handle = ResponseHandle::new(
            Arc::clone(&th),
            rsp_tx,
            version,
            opts.max_content_length,
            opts.use_decompress.then_some(opts.decompression),
        );
        registry.register(id, handle);
        self.cancel.arm(Arc::clone(&registry), id, channel.clone());

        let uri_encode = request.config().uri_encode().unwrap_or(opts.uri_encode);
        let outcome = writer.write_and_flush(&request, &channel, &ctx, uri_encode, version, http2);

        // Resolve the chunk-writer promise before awaiting the write, so a
        // streaming producer can push bytes while headers are in flight.
        if let (Some(tx), Some(chunk)) = (chunk_tx.take(), outcome.chunk) {
            let _ = tx.send(chunk);
        }

        match outcome.done.await {
            Ok(()) => {
                th.on_write_done();
                let task = read_timeout_task(Arc::clone(&registry), id, &request);
                let token = timer::global().schedule(task, read_timeout);
                th.add_cancel_task(token);
            }
            Err(err) => {
                th.on_write_failed(&err);
                debug!("failed to write request to {}: {}", request.uri(), err);
                if let Some(handle) = registry.remove(id) {
                    handle.fail(err);
                }
            }
        }
    }
}

/// Timeout task semantics: a registered handle is removed and failed; a
/// missing id means the response was already delivered, so firing is a
/// no-op.
fn read_timeout_task(
    registry: Arc<HandleRegistry>,
    id: u32,
    request: &Arc<HttpRequest>,
) -> Box<dyn FnOnce() + Send> {
    let uri = request.uri().to_string();
    Box::new(move || {
        if let Some(handle) = registry.remove(id) {
            debug!("request to {} timed out waiting for the response", uri);
            handle.fail(Error::new_read_timeout());
        }
    })
}

fn end_with(listener: &dyn Listener, request: &HttpRequest, ctx: &Context, err: Error) -> Error {
    listener.on_error(request, ctx, &err);
    err
}

/// Acquire-failure normalisation, preserved at this single site: an
/// illegal pool state surfaces as a generic transport error, an acquire
/// timeout as a connect failure.
fn normalize_acquire(err: Error) -> Error {
    match err.kind() {
        Kind::ChannelClosed => Error::new_io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "Error while acquiring channel",
        )),
        _ => err,
    }
}

/// Keep-alive fixup: HTTP/2 configurations must not emit `Connection`; on
/// HTTP/1 a caller-set value wins, otherwise the header reflects the
/// configured keep-alive against the version's default.
fn set_keep_alive(
    request: &mut HttpRequest,
    version: HttpVersion,
    configured: HttpVersion,
    keep_alive: bool,
) {
    if configured == HttpVersion::H2 {
        request.headers_mut().remove(CONNECTION);
    }
    if version == HttpVersion::H2 || request.headers().contains_key(CONNECTION) {
        return;
    }
    match (version, keep_alive) {
        (HttpVersion::H1_0, true) => {
            request
                .headers_mut()
                .insert(CONNECTION, http::HeaderValue::from_static("keep-alive"));
        }
        (HttpVersion::H1_1, false) => {
            request
                .headers_mut()
                .insert(CONNECTION, http::HeaderValue::from_static("close"));
        }
        _ => {}
    }
}

struct CancelState {
    armed: Mutex<Option<(Arc<HandleRegistry>, u32, Channel)>>,
    done: AtomicBool,
}

impl CancelState {
    fn new() -> CancelState {
        CancelState {
            armed: Mutex::new(None),
            done: AtomicBool::new(false),
        }
    }

    fn arm(&self, registry: Arc<HandleRegistry>, id: u32, channel: Channel) {
        *self.armed.lock().unwrap() = Some((registry, id, channel));
    }
}

/// The transceiver's half of a pending response.
///
/// Resolves with the response or a typed error. Dropping it before it
/// resolves cancels the request: the registry entry is removed, the
/// read-timeout token cancelled, and an HTTP/1 connection is closed rather
/// than reused. A cancellation racing normal completion is a no-op.
pub(crate) struct DispatchFuture {
    rx: oneshot::Receiver<Result<HttpResponse>>,
    cancel: Arc<CancelState>,
}

impl Future for DispatchFuture {
    type Output = Result<HttpResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.cancel.done.store(true, Ordering::Release);
                Poll::Ready(result)
            }
            Poll::Ready(Err(_)) => {
                self.cancel.done.store(true, Ordering::Release);
                Poll::Ready(Err(Error::new_canceled()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for DispatchFuture {
    fn drop(&mut self) {
        if self.cancel.done.load(Ordering::Acquire) {
            return;
        }
        if let Some((registry, id, _channel)) = self.cancel.armed.lock().unwrap().take() {
            if let Some(handle) = registry.remove(id) {
                handle.fail(Error::new_canceled());
            }
        }
    }
}

