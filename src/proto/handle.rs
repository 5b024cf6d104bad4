//! Response handles and connection-release strategies.
//!
//! A [`ResponseHandle`] lives in the connection's registry and turns inbound
//! response events into a completed response future. It wraps a
//! [`TimeoutHandle`], the listener decorator that also owns the read-timeout
//! token and decides *when* the connection goes back to its pool:
//! immediately after write-done on HTTP/2, after the response message ends
//! on HTTP/1.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, StatusCode};
use tokio::sync::oneshot;

use crate::config::{Decompression, HttpVersion};
use crate::context::Context;
use crate::listener::Listener;
use crate::proto::channel::Channel;
use crate::proto::pool::ChannelPool;
use crate::proto::registry::HandleRegistry;
use crate::proto::timer::Timeout;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::{Error, Result};

/// Extension header slot carrying the registry-assigned stream id of an
/// HTTP/2 request. Stripped before the headers reach the wire.
pub(crate) const STREAM_ID_EXT: HeaderName = HeaderName::from_static("x-http2-stream-id");

enum TimeoutSlot {
    Empty,
    Armed(Timeout),
    /// A terminal callback already ran; tokens armed from now on are dead
    /// on arrival.
    Terminated,
}

/// Listener decorator owning release timing and the read-timeout token.
pub(crate) struct TimeoutHandle {
    listener: Box<dyn Listener>,
    request: Arc<HttpRequest>,
    ctx: Arc<Context>,
    channel: Channel,
    pool: Arc<ChannelPool>,
    http2: bool,
    released: AtomicBool,
    timeout: Mutex<TimeoutSlot>,
}

impl TimeoutHandle {
    fn new(
        listener: Box<dyn Listener>,
        request: Arc<HttpRequest>,
        ctx: Arc<Context>,
        channel: Channel,
        pool: Arc<ChannelPool>,
        http2: bool,
    ) -> Arc<TimeoutHandle> {
        Arc::new(TimeoutHandle {
            listener,
            request,
            ctx,
            channel,
            pool,
            http2,
            released: AtomicBool::new(false),
            timeout: Mutex::new(TimeoutSlot::Empty),
        })
    }

    pub(crate) fn request(&self) -> &Arc<HttpRequest> {
        &self.request
    }

    pub(crate) fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Hands over the armed read-timeout token for later cancellation.
    ///
    /// A token arriving after the exchange already ended (the response can
    /// outrace the write-done continuation) is cancelled on the spot.
    pub(crate) fn add_cancel_task(&self, timeout: Timeout) {
        let mut slot = self.timeout.lock().unwrap();
        match *slot {
            TimeoutSlot::Terminated => {
                drop(slot);
                timeout.cancel();
            }
            _ => *slot = TimeoutSlot::Armed(timeout),
        }
    }

    fn cancel_timeout(&self) {
        let mut slot = self.timeout.lock().unwrap();
        let prev = std::mem::replace(&mut *slot, TimeoutSlot::Terminated);
        drop(slot);
        if let TimeoutSlot::Armed(timeout) = prev {
            timeout.cancel();
        }
    }

    fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.pool.release(self.channel.clone());
        }
    }

    pub(crate) fn on_write_attempt(&self) {
        self.listener.on_write_attempt(&self.request, &self.ctx);
    }

    pub(crate) fn on_write_done(&self) {
        // On HTTP/2 the connection is multiplexed: give it back right away,
        // the response keeps flowing through the registry.
        if self.http2 {
            self.release();
        }
        self.listener.on_write_done(&self.request, &self.ctx);
    }

    pub(crate) fn on_write_failed(&self, cause: &Error) {
        self.listener.on_write_failed(&self.request, &self.ctx, cause);
    }

    pub(crate) fn on_message_received(&self) {
        self.listener.on_message_received(&self.request, &self.ctx);
    }

    pub(crate) fn on_completed(&self) {
        self.cancel_timeout();
        if !self.http2 {
            self.release();
        }
        self.listener.on_completed(&self.request, &self.ctx);
    }

    pub(crate) fn on_error(&self, cause: &Error) {
        self.cancel_timeout();
        // An HTTP/1 connection in an unknown exchange state cannot be
        // reused; close it so release drops it from the pool.
        if !self.http2 {
            self.channel.close();
        }
        self.release();
        self.listener.on_error(&self.request, &self.ctx, cause);
    }
}

/// The per-protocol strategy building timeout handles and registering
/// response handles, selected by inspecting the channel's pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TransceiverHandle {
    H1,
    H2,
}

impl TransceiverHandle {
    pub(crate) fn for_channel(channel: &Channel) -> TransceiverHandle {
        if channel.is_http2() {
            TransceiverHandle::H2
        } else {
            TransceiverHandle::H1
        }
    }

    pub(crate) fn build_timeout_handle(
        &self,
        channel: Channel,
        pool: Arc<ChannelPool>,
        listener: Box<dyn Listener>,
        request: Arc<HttpRequest>,
        ctx: Arc<Context>,
    ) -> Arc<TimeoutHandle> {
        TimeoutHandle::new(
            listener,
            request,
            ctx,
            channel,
            pool,
            matches!(self, TransceiverHandle::H2),
        )
    }

    /// Reserves a request id for the exchange. On HTTP/2 the id is written
    /// into the request's stream-id extension slot so the outbound path can
    /// route the stream.
    pub(crate) fn reserve_id(&self, request: &mut HttpRequest, registry: &HandleRegistry) -> u32 {
        let id = registry.reserve();
        if matches!(self, TransceiverHandle::H2) {
            if let Ok(value) = http::HeaderValue::from_str(&id.to_string()) {
                request.headers_mut().insert(STREAM_ID_EXT, value);
            }
        }
        id
    }
}

type ResponseTx = oneshot::Sender<Result<HttpResponse>>;

/// The registry-held handle of one in-flight exchange.
///
/// Aggregates the response body up to `max_content_length` and completes
/// the response promise exactly once, through either [`complete`] or
/// [`fail`], both of which consume the handle. The caller removes the
/// handle from the registry first, so no table entry outlives a resolved
/// promise.
///
/// [`complete`]: ResponseHandle::complete
/// [`fail`]: ResponseHandle::fail
pub(crate) struct ResponseHandle {
    th: Arc<TimeoutHandle>,
    tx: ResponseTx,
    version: HttpVersion,
    status: Option<StatusCode>,
    headers: HeaderMap,
    buf: BytesMut,
    max_content_length: u64,
    decompression: Option<Decompression>,
}

impl ResponseHandle {
    pub(crate) fn new(
        th: Arc<TimeoutHandle>,
        tx: ResponseTx,
        version: HttpVersion,
        max_content_length: u64,
        decompression: Option<Decompression>,
    ) -> ResponseHandle {
        ResponseHandle {
            th,
            tx,
            version,
            status: None,
            headers: HeaderMap::new(),
            buf: BytesMut::new(),
            max_content_length,
            decompression,
        }
    }

    pub(crate) fn timeout_handle(&self) -> &Arc<TimeoutHandle> {
        &self.th
    }

    /// The response head arrived.
    pub(crate) fn on_message(&mut self, status: StatusCode, headers: HeaderMap) {
        self.status = Some(status);
        self.headers = headers;
        self.th.on_message_received();
    }

    /// A body chunk arrived. Returns `false` when the aggregate would
    /// exceed the configured maximum; the caller then removes this handle
    /// and fails it.
    #[must_use]
    pub(crate) fn on_data(&mut self, data: Bytes) -> bool {
        if (self.buf.len() + data.len()) as u64 > self.max_content_length {
            return false;
        }
        self.buf.put(data);
        true
    }

    /// Whether the exchange was initiated by a HEAD request, whose response
    /// carries no body regardless of its framing headers.
    pub(crate) fn is_head_request(&self) -> bool {
        self.th.request().method() == http::Method::HEAD
    }

    /// An interim 100-continue arrived: resume the withheld body.
    pub(crate) fn on_continue(&self) {
        if let Some(callback) = self.th.ctx().remove_expect_continue_callback() {
            callback();
        }
    }

    /// The response message ended; resolve the promise.
    pub(crate) fn complete(self) {
        // A response that arrived without a 100-continue discards the
        // withheld body: dropping the callback resolves the writer's gate.
        drop(self.th.ctx().remove_expect_continue_callback());
        let status = self.status.unwrap_or(StatusCode::OK);
        let mut response =
            HttpResponse::new(status, self.version, self.headers, self.buf.freeze());
        if let Some(decompression) = self.decompression {
            if let Err(err) = response.decompress(decompression) {
                self.th.on_error(&err);
                let _ = self.tx.send(Err(err));
                return;
            }
        }
        self.th.on_completed();
        let _ = self.tx.send(Ok(response));
    }

    /// Fail the promise. The terminal listener callback (and with it timer
    /// cancellation and connection release) runs before the promise
    /// resolves.
    pub(crate) fn fail(self, cause: Error) {
        drop(self.th.ctx().remove_expect_continue_callback());
        self.th.on_error(&cause);
        let _ = self.tx.send(Err(cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ChannelPoolOptions, Http1Options, Http2Options, HttpVersion, NetOptions, SslOptions,
    };
    use crate::listener::NoopListener;
    use crate::proto::channel::embedded::EmbeddedChannel;
    use crate::proto::connect::Connector;
    use crate::proto::pool::{ChannelPools, Endpoint};
    use crate::proto::timer::HashedWheelTimer;
    use crate::request::HttpRequest;
    use std::time::Duration;

    fn pool_for(version: HttpVersion) -> Arc<ChannelPool> {
        let connector = Arc::new(Connector::new(
            version,
            false,
            Duration::from_secs(3),
            NetOptions::of_default(),
            Http1Options::of_default(),
            Http2Options::of_default(),
            SslOptions::of_default(),
        ));
        let pools = ChannelPools::new(connector, ChannelPoolOptions::of_default(), None);
        pools.get_or_create(Endpoint {
            scheme: crate::config::Scheme::Http,
            host: "127.0.0.1".into(),
            port: 80,
        })
    }

    fn handle_for(
        version: HttpVersion,
    ) -> (EmbeddedChannel, Arc<ChannelPool>, Arc<TimeoutHandle>) {
        let embedded = EmbeddedChannel::new(version);
        let pool = pool_for(version);
        let request = Arc::new(HttpRequest::get("http://127.0.0.1/abc").build().unwrap());
        let ctx = Arc::new(Context::new());
        let strategy = TransceiverHandle::for_channel(&embedded.channel);
        let th = strategy.build_timeout_handle(
            embedded.channel.clone(),
            Arc::clone(&pool),
            Box::new(NoopListener),
            request,
            ctx,
        );
        (embedded, pool, th)
    }

    #[tokio::test]
    async fn h1_releases_after_message_completed_exactly_once() {
        let (_embedded, pool, th) = handle_for(HttpVersion::H1_1);

        // Write completion must not give the connection back.
        th.on_write_done();
        assert_eq!(pool.idle_len(), 0);

        th.on_completed();
        assert_eq!(pool.idle_len(), 1);

        // A late error path must not release again.
        th.on_error(&Error::new_read_timeout());
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn h1_error_closes_the_connection_before_release() {
        let (embedded, pool, th) = handle_for(HttpVersion::H1_1);
        th.on_error(&Error::new_read_timeout());
        assert!(!embedded.channel.is_active());
        // A dead connection never lands in the idle set.
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn h2_write_done_and_error_are_release_wise_harmless() {
        let (embedded, pool, th) = handle_for(HttpVersion::H2);
        th.on_write_done();
        th.on_error(&Error::new_read_timeout());
        assert_eq!(pool.idle_len(), 0);
        // Multiplexed connections stay up through per-stream failures.
        assert!(embedded.channel.is_active());
    }

    #[tokio::test]
    async fn terminal_callbacks_cancel_the_timeout_token() {
        let timer = HashedWheelTimer::new(Duration::from_millis(10), 32);
        let (_embedded, _pool, th) = handle_for(HttpVersion::H1_1);
        let token = timer.schedule(Box::new(|| panic!("must not fire")), Duration::from_secs(60));
        th.add_cancel_task(token.clone());
        th.on_completed();
        assert!(token.is_cancelled());
        timer.stop();
    }

    #[tokio::test]
    async fn registry_entries_balance_put_and_remove() {
        let (_embedded, _pool, th) = handle_for(HttpVersion::H1_1);
        let registry = HandleRegistry::new(false);
        let (tx, rx) = oneshot::channel();
        let handle = ResponseHandle::new(
            Arc::clone(&th),
            tx,
            HttpVersion::H1_1,
            1024,
            None,
        );
        let id = registry.put(handle);
        assert_eq!(registry.len(), 1);

        let handle = registry.remove(id).unwrap();
        assert_eq!(registry.len(), 0);
        handle.fail(Error::new_closed());
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn clear_fails_every_outstanding_handle() {
        let (_embedded, _pool, th) = handle_for(HttpVersion::H1_1);
        let registry = HandleRegistry::new(false);
        let (tx, rx) = oneshot::channel();
        registry.register(
            registry.reserve(),
            ResponseHandle::new(Arc::clone(&th), tx, HttpVersion::H1_1, 1024, None),
        );

        registry.clear_with(Error::new_closed);
        assert_eq!(registry.len(), 0);
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected_by_on_data() {
        let (_embedded, _pool, th) = handle_for(HttpVersion::H1_1);
        let (tx, _rx) = oneshot::channel();
        let mut handle =
            ResponseHandle::new(Arc::clone(&th), tx, HttpVersion::H1_1, 8, None);
        assert!(handle.on_data(Bytes::from_static(b"12345678")));
        assert!(!handle.on_data(Bytes::from_static(b"9")));
    }
}
