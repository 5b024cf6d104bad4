//! The connection type and its outbound seam.
//!
//! A [`Channel`] is one live transport connection. Writers hand it
//! [`OutboundMsg`]s; how those become wire bytes is the business of the
//! protocol behind the [`Outbound`] seam — the HTTP/1 connection task, the
//! h2 send handle, or the embedded capture queue used by tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method};
use tokio::sync::oneshot;

use crate::config::{HttpVersion, Scheme};
use crate::proto::registry::HandleRegistry;
use crate::{Error, Result};

/// The serialised head of a request, protocol-agnostic.
///
/// HTTP/1 renders `method target version` plus headers (which already carry
/// `Host`); HTTP/2 maps the loose fields onto pseudo-headers.
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: HttpVersion,
    pub(crate) scheme: Scheme,
    pub(crate) authority: String,
    pub(crate) headers: HeaderMap,
}

/// One message for the outbound half of a connection.
pub(crate) enum OutboundMsg {
    /// HTTP/1 head, optionally with a content-length body flushed in the
    /// same write.
    H1Head {
        head: RequestHead,
        body: Option<Bytes>,
    },
    /// HTTP/1 body data. `chunked` selects chunked framing, matching what
    /// the head declared; `end` additionally emits the terminal zero-size
    /// chunk.
    H1Data {
        data: Bytes,
        chunked: bool,
        end: bool,
    },
    /// HTTP/2 HEADERS for the stream routed under the registry id.
    H2Headers {
        head: RequestHead,
        stream_id: u32,
        end_stream: bool,
    },
    /// HTTP/2 DATA for an open stream.
    H2Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    /// Run a closure on the connection's task.
    Task(Box<dyn FnOnce() + Send>),
    /// Tear the connection down.
    Shutdown,
}

impl OutboundMsg {
    /// Rough outbound-buffer footprint, used for the writability gauge.
    pub(crate) fn size_hint(&self) -> usize {
        match self {
            OutboundMsg::H1Head { head, body } => {
                head_size(head) + body.as_ref().map(Bytes::len).unwrap_or(0)
            }
            OutboundMsg::H1Data { data, .. } => data.len() + 12,
            OutboundMsg::H2Headers { head, .. } => head_size(head),
            OutboundMsg::H2Data { data, .. } => data.len() + 9,
            OutboundMsg::Task(_) | OutboundMsg::Shutdown => 0,
        }
    }
}

fn head_size(head: &RequestHead) -> usize {
    let headers: usize = head
        .headers
        .iter()
        .map(|(k, v)| k.as_str().len() + v.len() + 4)
        .sum();
    head.target.len() + head.authority.len() + headers + 64
}

/// Receiving half of a write-completion signal.
pub(crate) type SignalRx = oneshot::Receiver<Result<()>>;

/// Awaits a write signal, mapping a torn-down connection to a closed error.
pub(crate) async fn wait(signal: SignalRx) -> Result<()> {
    signal.await.unwrap_or_else(|_| Err(Error::new_closed()))
}

/// The protocol-specific outbound half of a connection.
///
/// `write` resolves when the message's last byte reached the transport's
/// outbound buffer, not when it hit the wire.
pub(crate) trait Outbound: Send + Sync {
    fn write(&self, msg: OutboundMsg) -> BoxFuture<'static, Result<()>>;

    /// False once queued outbound bytes exceed the high-water mark.
    fn is_writable(&self) -> bool;

    fn close(&self);
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct ChannelInner {
    id: u64,
    remote: SocketAddr,
    version: HttpVersion,
    outbound: Arc<dyn Outbound>,
    registry: Arc<HandleRegistry>,
    active: Arc<AtomicBool>,
}

/// A live transport connection.
///
/// Cheap to clone; all clones observe the same connection state.
#[derive(Clone)]
pub(crate) struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        remote: SocketAddr,
        version: HttpVersion,
        outbound: Arc<dyn Outbound>,
        registry: Arc<HandleRegistry>,
        active: Arc<AtomicBool>,
    ) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                remote,
                version,
                outbound,
                registry,
                active,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn remote(&self) -> SocketAddr {
        self.inner.remote
    }

    /// The protocol installed on this connection's pipeline.
    pub(crate) fn version(&self) -> HttpVersion {
        self.inner.version
    }

    pub(crate) fn is_http2(&self) -> bool {
        self.inner.version == HttpVersion::H2
    }

    pub(crate) fn registry(&self) -> &Arc<HandleRegistry> {
        &self.inner.registry
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.inner.outbound.is_writable()
    }

    pub(crate) fn write(&self, msg: OutboundMsg) -> BoxFuture<'static, Result<()>> {
        self.inner.outbound.write(msg)
    }

    /// Runs `task` on the connection's task exactly once, even when
    /// submitted from outside it.
    pub(crate) fn run_in_channel(&self, task: Box<dyn FnOnce() + Send>) {
        let _ = self.inner.outbound.write(OutboundMsg::Task(task));
    }

    /// Marks the connection dead and tears the pipeline down.
    pub(crate) fn close(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.outbound.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("version", &self.inner.version)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Shared writability gauge: queued outbound bytes against a high-water
/// mark.
pub(crate) struct WriteGauge {
    pending: AtomicUsize,
    high_water: usize,
}

impl WriteGauge {
    pub(crate) fn new(high_water: usize) -> WriteGauge {
        WriteGauge {
            pending: AtomicUsize::new(0),
            high_water,
        }
    }

    pub(crate) fn add(&self, bytes: usize) {
        self.pending.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn sub(&self, bytes: usize) {
        self.pending.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.pending.load(Ordering::Acquire) < self.high_water
    }
}

#[cfg(test)]
pub(crate) mod embedded {
    //! In-memory connection capturing outbound messages, the test double
    //! for a real transport.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) struct EmbeddedOutbound {
        msgs: Mutex<VecDeque<OutboundMsg>>,
        writable: AtomicBool,
        tasks_run: AtomicUsize,
    }

    impl Outbound for EmbeddedOutbound {
        fn write(&self, msg: OutboundMsg) -> BoxFuture<'static, Result<()>> {
            match msg {
                OutboundMsg::Task(task) => {
                    task();
                    self.tasks_run.fetch_add(1, Ordering::SeqCst);
                }
                OutboundMsg::Shutdown => {}
                other => self.msgs.lock().unwrap().push_back(other),
            }
            Box::pin(async { Ok(()) })
        }

        fn is_writable(&self) -> bool {
            self.writable.load(Ordering::Acquire)
        }

        fn close(&self) {}
    }

    pub(crate) struct EmbeddedChannel {
        pub(crate) channel: Channel,
        outbound: Arc<EmbeddedOutbound>,
    }

    impl EmbeddedChannel {
        pub(crate) fn new(version: HttpVersion) -> EmbeddedChannel {
            let outbound = Arc::new(EmbeddedOutbound {
                msgs: Mutex::new(VecDeque::new()),
                writable: AtomicBool::new(true),
                tasks_run: AtomicUsize::new(0),
            });
            let registry = Arc::new(HandleRegistry::new(version == HttpVersion::H2));
            let channel = Channel::new(
                "127.0.0.1:80".parse().unwrap(),
                version,
                outbound.clone() as Arc<dyn Outbound>,
                registry,
                Arc::new(AtomicBool::new(true)),
            );
            EmbeddedChannel { channel, outbound }
        }

        /// Pops the next captured outbound message.
        pub(crate) fn read_outbound(&self) -> Option<OutboundMsg> {
            self.outbound.msgs.lock().unwrap().pop_front()
        }

        pub(crate) fn set_writable(&self, writable: bool) {
            self.outbound.writable.store(writable, Ordering::Release);
        }

        pub(crate) fn tasks_run(&self) -> usize {
            self.outbound.tasks_run.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::embedded::EmbeddedChannel;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_in_channel_executes_exactly_once() {
        let embedded = EmbeddedChannel::new(HttpVersion::H1_1);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        embedded
            .channel
            .run_in_channel(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(embedded.tasks_run(), 1);
        assert!(embedded.read_outbound().is_none());
    }

    #[test]
    fn write_gauge_toggles_at_high_water() {
        let gauge = WriteGauge::new(16);
        assert!(gauge.is_writable());
        gauge.add(16);
        assert!(!gauge.is_writable());
        gauge.sub(8);
        assert!(gauge.is_writable());
    }

    #[test]
    fn embedded_writability_is_togglable() {
        let embedded = EmbeddedChannel::new(HttpVersion::H1_1);
        assert!(embedded.channel.is_writable());
        embedded.set_writable(false);
        assert!(!embedded.channel.is_writable());
    }
}
