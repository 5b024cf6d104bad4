//! Per-endpoint connection pools.
//!
//! [`ChannelPools`] maps `(scheme, host, port)` endpoints to their pool.
//! An HTTP/1 pool hands out at most `pool_size` connections, parking up to
//! `waiting_queue_length` acquires when all of them are bound to in-flight
//! requests. When HTTP/2 is configured, one multiplexed connection per
//! endpoint is shared by every acquire; releasing it is accounting only.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::{ChannelPoolOptions, ChannelPoolOptionsProvider, Scheme};
use crate::proto::channel::Channel;
use crate::proto::connect::Connector;
use crate::{Error, Result};

/// The pooling key: one pool per `(scheme, host, port)`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Endpoint {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Endpoint {
    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type SharedConnect = Shared<BoxFuture<'static, std::result::Result<Channel, Arc<Error>>>>;

/// The process-visible map of pools, shared by every request of a client.
pub(crate) struct ChannelPools {
    pools: Mutex<HashMap<Endpoint, Arc<ChannelPool>>>,
    connector: Arc<Connector>,
    defaults: ChannelPoolOptions,
    provider: Option<Arc<dyn ChannelPoolOptionsProvider>>,
}

impl ChannelPools {
    pub(crate) fn new(
        connector: Arc<Connector>,
        defaults: ChannelPoolOptions,
        provider: Option<Arc<dyn ChannelPoolOptionsProvider>>,
    ) -> ChannelPools {
        ChannelPools {
            pools: Mutex::new(HashMap::new()),
            connector,
            defaults,
            provider,
        }
    }

    pub(crate) fn get_or_create(&self, endpoint: Endpoint) -> Arc<ChannelPool> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(&endpoint) {
            return Arc::clone(pool);
        }
        let opts = self
            .provider
            .as_ref()
            .and_then(|p| p.get(&endpoint.authority()))
            .unwrap_or_else(|| self.defaults.clone());
        debug!("creating channel pool for {:?}", endpoint);
        let pool = Arc::new(ChannelPool::new(
            endpoint.clone(),
            opts,
            Arc::clone(&self.connector),
        ));
        pools.insert(endpoint, Arc::clone(&pool));
        pool
    }

    /// Closes every pool, dropping idle connections and failing parked
    /// acquires.
    pub(crate) fn close(&self) {
        let drained: Vec<Arc<ChannelPool>> =
            self.pools.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pool in drained {
            pool.close();
        }
    }
}

struct PoolState {
    idle: VecDeque<(Channel, Instant)>,
    total: usize,
    waiters: VecDeque<oneshot::Sender<Result<Channel>>>,
    shared_h2: Option<SharedConnect>,
    last_addr: Option<SocketAddr>,
    closed: bool,
}

/// Pool of connections to one endpoint.
pub(crate) struct ChannelPool {
    endpoint: Endpoint,
    opts: ChannelPoolOptions,
    connector: Arc<Connector>,
    h2_mode: AtomicBool,
    // Releases can run off the runtime (timer thread); refills spawn
    // through the handle captured at pool creation.
    runtime: tokio::runtime::Handle,
    state: Mutex<PoolState>,
}

enum Acquire {
    Ready(Channel),
    Connect,
    Wait(oneshot::Receiver<Result<Channel>>),
    Reject,
    Closed,
}

impl ChannelPool {
    fn new(endpoint: Endpoint, opts: ChannelPoolOptions, connector: Arc<Connector>) -> ChannelPool {
        let h2_mode = connector.attempts_h2();
        ChannelPool {
            endpoint,
            opts,
            connector,
            h2_mode: AtomicBool::new(h2_mode),
            runtime: tokio::runtime::Handle::current(),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                waiters: VecDeque::new(),
                shared_h2: None,
                last_addr: None,
                closed: false,
            }),
        }
    }

    /// Acquires a connection for a request destined to `addr`.
    pub(crate) async fn acquire(self: &Arc<Self>, addr: SocketAddr) -> Result<Channel> {
        self.state.lock().unwrap().last_addr = Some(addr);
        if self.h2_mode.load(Ordering::Acquire) {
            self.acquire_h2(addr).await
        } else {
            self.acquire_h1(addr).await
        }
    }

    async fn acquire_h1(self: &Arc<Self>, addr: SocketAddr) -> Result<Channel> {
        let action = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                Acquire::Closed
            } else if let Some(channel) = Self::pop_idle(&mut state, &self.opts) {
                Acquire::Ready(channel)
            } else if state.total < self.opts.size() {
                state.total += 1;
                Acquire::Connect
            } else if state.waiters.len() < self.opts.queue_length() {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Acquire::Wait(rx)
            } else {
                Acquire::Reject
            }
        };

        match action {
            Acquire::Ready(channel) => Ok(channel),
            Acquire::Connect => match self.connect(addr).await {
                Ok(channel) => Ok(channel),
                Err(err) => {
                    self.forget_one();
                    Err(err)
                }
            },
            Acquire::Wait(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => Err(Error::new_closed()),
            },
            Acquire::Reject => Err(Error::new_pool_exhausted()),
            Acquire::Closed => Err(Error::new_closed()),
        }
    }

    fn pop_idle(state: &mut PoolState, opts: &ChannelPoolOptions) -> Option<Channel> {
        while let Some((channel, since)) = state.idle.pop_front() {
            if !channel.is_active() {
                state.total -= 1;
                continue;
            }
            if let Some(idle_deadline) = opts.idle_deadline() {
                if since.elapsed() >= idle_deadline {
                    trace!("dropping idle connection {}", channel.id());
                    channel.close();
                    state.total -= 1;
                    continue;
                }
            }
            return Some(channel);
        }
        None
    }

    async fn acquire_h2(self: &Arc<Self>, addr: SocketAddr) -> Result<Channel> {
        // One extra round covers the shared connection having died between
        // acquires.
        for _ in 0..2 {
            let connect = {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(Error::new_closed());
                }
                match state.shared_h2.clone() {
                    Some(fut) => fut,
                    None => {
                        let pool = Arc::clone(self);
                        let fut: SharedConnect =
                            async move { pool.connect(addr).await.map_err(Arc::new) }
                                .boxed()
                                .shared();
                        state.shared_h2 = Some(fut.clone());
                        fut
                    }
                }
            };

            match connect.await {
                Ok(channel) if !channel.is_http2() => {
                    // ALPN fell back to HTTP/1: this endpoint pools the h1
                    // way from here on.
                    debug!("h2 unavailable for {:?}, demoting pool", self.endpoint);
                    self.h2_mode.store(false, Ordering::Release);
                    let mut state = self.state.lock().unwrap();
                    state.shared_h2 = None;
                    state.total += 1;
                    return Ok(channel);
                }
                Ok(channel) if channel.is_active() => return Ok(channel),
                Ok(_) => {
                    self.state.lock().unwrap().shared_h2 = None;
                }
                Err(err) => {
                    self.state.lock().unwrap().shared_h2 = None;
                    return Err(Error::new(err.kind()).with(err.to_string()));
                }
            }
        }
        Err(Error::new_connection_inactive())
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Channel> {
        tokio::time::timeout(
            self.opts.connect_deadline(),
            self.connector.connect(&self.endpoint, addr),
        )
        .await
        .map_err(|_| Error::new_connect_timeout())?
    }

    /// A connection slot was given up without producing a connection; let a
    /// parked waiter have it.
    fn forget_one(self: &Arc<Self>) {
        let should_refill = {
            let mut state = self.state.lock().unwrap();
            state.total -= 1;
            if !state.waiters.is_empty() && state.total < self.opts.size() {
                state.total += 1;
                true
            } else {
                false
            }
        };
        if should_refill {
            self.spawn_refill();
        }
    }

    fn spawn_refill(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        self.runtime.spawn(async move {
            let addr = match pool.state.lock().unwrap().last_addr {
                Some(addr) => addr,
                None => return,
            };
            match pool.connect(addr).await {
                Ok(channel) => pool.release(channel),
                Err(err) => {
                    let waiter = pool.state.lock().unwrap().waiters.pop_front();
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Err(err));
                            pool.forget_one();
                        }
                        None => pool.forget_one(),
                    }
                }
            }
        });
    }

    /// Returns `channel` to the pool.
    ///
    /// HTTP/2 releases are accounting only. A closed HTTP/1 connection is
    /// dropped from the pool and a parked waiter is woken, which may
    /// trigger a fresh connect.
    pub(crate) fn release(self: &Arc<Self>, channel: Channel) {
        if channel.is_http2() {
            return;
        }

        let mut state = self.state.lock().unwrap();
        if state.closed {
            drop(state);
            channel.close();
            return;
        }
        if !channel.is_active() {
            state.total = state.total.saturating_sub(1);
            if !state.waiters.is_empty() && state.total < self.opts.size() {
                state.total += 1;
                drop(state);
                self.spawn_refill();
            }
            return;
        }

        let mut channel = channel;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(Ok(channel)) {
                Ok(()) => return,
                // The waiter gave up (acquire cancelled); try the next one.
                Err(payload) => match payload {
                    Ok(returned) => channel = returned,
                    Err(_) => return,
                },
            }
        }
        state.idle.push_back((channel, Instant::now()));
    }

    /// Fails parked waiters and drops every pooled connection.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        for (channel, _) in state.idle.drain(..) {
            channel.close();
        }
        while let Some(waiter) = state.waiters.pop_front() {
            let _ = waiter.send(Err(Error::new_closed()));
        }
        state.shared_h2 = None;
        state.total = 0;
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    #[cfg(test)]
    pub(crate) fn total(&self) -> usize {
        self.state.lock().unwrap().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Http1Options, Http2Options, HttpVersion, NetOptions, SslOptions};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn silent_server() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn h1_pools(size: usize, queue: usize) -> ChannelPools {
        let connector = Arc::new(Connector::new(
            HttpVersion::H1_1,
            false,
            Duration::from_secs(3),
            NetOptions::of_default(),
            Http1Options::of_default(),
            Http2Options::of_default(),
            SslOptions::of_default(),
        ));
        ChannelPools::new(
            connector,
            ChannelPoolOptions::of_default()
                .pool_size(size)
                .waiting_queue_length(queue),
            None,
        )
    }

    fn endpoint_of(addr: SocketAddr) -> Endpoint {
        Endpoint {
            scheme: Scheme::Http,
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    #[tokio::test]
    async fn bounded_pool_parks_then_rejects_acquires() {
        let (listener, addr) = silent_server().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                held.push(sock);
            }
        });

        let pools = h1_pools(1, 1);
        let pool = pools.get_or_create(endpoint_of(addr));

        let first = pool.acquire(addr).await.unwrap();
        assert_eq!(pool.total(), 1);

        let parked_pool = Arc::clone(&pool);
        let parked = tokio::spawn(async move { parked_pool.acquire(addr).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished());

        // Queue is full now: the next acquire is rejected outright.
        let overflow = pool.acquire(addr).await.unwrap_err();
        assert!(overflow.is_pool_exhausted());

        pool.release(first.clone());
        let handed_over = parked.await.unwrap().unwrap();
        assert_eq!(handed_over.id(), first.id());
    }

    #[tokio::test]
    async fn releasing_a_dead_connection_drops_it_from_the_pool() {
        let (listener, addr) = silent_server().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                held.push(sock);
            }
        });

        let pools = h1_pools(2, 2);
        let pool = pools.get_or_create(endpoint_of(addr));

        let channel = pool.acquire(addr).await.unwrap();
        assert_eq!(pool.total(), 1);
        channel.close();
        pool.release(channel);
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (listener, addr) = silent_server().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                held.push(sock);
            }
        });

        let pools = h1_pools(4, 4);
        let pool = pools.get_or_create(endpoint_of(addr));

        let first = pool.acquire(addr).await.unwrap();
        let id = first.id();
        pool.release(first);
        assert_eq!(pool.idle_len(), 1);

        let again = pool.acquire(addr).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.total(), 1);
    }

    #[tokio::test]
    async fn closed_pools_reject_acquires_and_fail_waiters() {
        let (listener, addr) = silent_server().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (sock, _) = listener.accept().await.unwrap();
                held.push(sock);
            }
        });

        let pools = h1_pools(1, 4);
        let pool = pools.get_or_create(endpoint_of(addr));
        let _held = pool.acquire(addr).await.unwrap();

        let parked_pool = Arc::clone(&pool);
        let parked = tokio::spawn(async move { parked_pool.acquire(addr).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        pools.close();
        let err = parked.await.unwrap().unwrap_err();
        assert!(err.is_closed());
        assert!(pool.acquire(addr).await.is_err());
    }
}
