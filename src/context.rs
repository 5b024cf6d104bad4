//! Per-request scratchpad.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use futures_channel::oneshot;
use futures_util::future::Shared;

use crate::proto::writer::ChunkWriter;

/// A future resolving to the [`ChunkWriter`] of an in-flight chunked request.
///
/// The promise is completed right after the request writer is invoked, which
/// may be before the headers have finished flushing. If the request dies
/// before a writer exists, the sender is dropped and awaiting yields
/// `Canceled`; the actual cause is delivered through the response future.
pub type ChunkWriterFuture = Shared<oneshot::Receiver<ChunkWriter>>;

type Callback = Box<dyn FnOnce() + Send>;

/// Mutable state observable to interceptors, filters and the transceiver for
/// the lifetime of one request.
///
/// Created when the user issues the request and dropped when the response
/// future completes. Well-known state (the expect-continue flag and callback,
/// the chunk-writer promise) lives in typed slots; anything else goes through
/// the untyped attribute map.
#[derive(Default)]
pub struct Context {
    expect_continue_enabled: AtomicBool,
    expect_continue_callback: Mutex<Option<Callback>>,
    chunk_writer: Mutex<Option<ChunkWriterFuture>>,
    chunk_installed: tokio::sync::Notify,
    attrs: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    /// Whether the writer should hold the body back until a 100-continue
    /// signal arrives.
    pub fn is_expect_continue_enabled(&self) -> bool {
        self.expect_continue_enabled.load(Ordering::Relaxed)
    }

    pub fn set_expect_continue_enabled(&self, enabled: bool) {
        self.expect_continue_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Stores the resumption callback that streams the withheld body.
    ///
    /// Installed by the request writer; taken and run by the inbound path
    /// when the interim response arrives.
    pub fn set_expect_continue_callback(&self, callback: Callback) {
        *self.expect_continue_callback.lock().unwrap() = Some(callback);
    }

    /// Removes the stored resumption callback, if any.
    pub fn remove_expect_continue_callback(&self) -> Option<Callback> {
        self.expect_continue_callback.lock().unwrap().take()
    }

    pub(crate) fn set_chunk_writer(&self, fut: ChunkWriterFuture) {
        *self.chunk_writer.lock().unwrap() = Some(fut);
        self.chunk_installed.notify_waiters();
    }

    /// The chunk-writer promise of a chunked request, `None` otherwise.
    pub fn chunk_writer(&self) -> Option<ChunkWriterFuture> {
        self.chunk_writer.lock().unwrap().clone()
    }

    /// Resolves once a chunk-writer promise has been installed. Check
    /// [`Context::chunk_writer`] after creating this future to close the
    /// install/wait race.
    pub(crate) fn chunk_installed(&self) -> tokio::sync::futures::Notified<'_> {
        self.chunk_installed.notified()
    }

    /// Stores an arbitrary attribute, replacing any previous value under the
    /// same name.
    pub fn set_attr<T: Any + Send + Sync>(&self, name: &'static str, value: T) {
        self.attrs.lock().unwrap().insert(name, Box::new(value));
    }

    /// Returns a copy of the attribute stored under `name`.
    pub fn attr<T: Any + Clone>(&self, name: &str) -> Option<T> {
        self.attrs
            .lock()
            .unwrap()
            .get(name)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Removes and returns the attribute stored under `name`.
    pub fn remove_attr<T: Any>(&self, name: &str) -> Option<T> {
        self.attrs
            .lock()
            .unwrap()
            .remove(name)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field(
                "expect_continue_enabled",
                &self.expect_continue_enabled.load(Ordering::Relaxed),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_continue_flag_roundtrip() {
        let ctx = Context::new();
        assert!(!ctx.is_expect_continue_enabled());
        ctx.set_expect_continue_enabled(true);
        assert!(ctx.is_expect_continue_enabled());
    }

    #[test]
    fn callback_is_taken_once() {
        let ctx = Context::new();
        ctx.set_expect_continue_callback(Box::new(|| {}));
        assert!(ctx.remove_expect_continue_callback().is_some());
        assert!(ctx.remove_expect_continue_callback().is_none());
    }

    #[test]
    fn attrs_roundtrip() {
        let ctx = Context::new();
        ctx.set_attr("redirects", 3u32);
        assert_eq!(ctx.attr::<u32>("redirects"), Some(3));
        assert_eq!(ctx.remove_attr::<u32>("redirects"), Some(3));
        assert_eq!(ctx.attr::<u32>("redirects"), None);
    }
}
