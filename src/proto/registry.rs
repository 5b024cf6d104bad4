//! Per-connection response handle registry.
//!
//! Routes inbound response events to the handle of the request that caused
//! them. HTTP/1 connections hold at most one in-flight exchange under the
//! fixed id 1; HTTP/2 connections key concurrent streams by odd ids
//! assigned monotonically, wrapping below 2^31 once exhausted.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::proto::handle::ResponseHandle;
use crate::Error;

const H1_REQUEST_ID: u32 = 1;
const MAX_STREAM_ID: u32 = i32::MAX as u32;

pub(crate) struct HandleRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    handles: HashMap<u32, ResponseHandle>,
    next_id: u32,
    h2: bool,
}

impl HandleRegistry {
    pub(crate) fn new(h2: bool) -> HandleRegistry {
        HandleRegistry {
            inner: Mutex::new(Inner {
                handles: HashMap::new(),
                next_id: 1,
                h2,
            }),
        }
    }

    /// Reserves a fresh id without storing anything yet, so the id can be
    /// stamped onto the request before the handle is built around it.
    pub(crate) fn reserve(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        Self::alloc(&mut inner)
    }

    /// Stores `handle` under a previously reserved id.
    pub(crate) fn register(&self, id: u32, handle: ResponseHandle) {
        let mut inner = self.inner.lock().unwrap();
        let replaced = inner.handles.insert(id, handle);
        debug_assert!(replaced.is_none(), "request id {} already in flight", id);
    }

    /// Assigns a fresh id and stores `handle` under it.
    pub(crate) fn put(&self, handle: ResponseHandle) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::alloc(&mut inner);
        let replaced = inner.handles.insert(id, handle);
        debug_assert!(replaced.is_none(), "request id {} already in flight", id);
        id
    }

    fn alloc(inner: &mut Inner) -> u32 {
        if !inner.h2 {
            return H1_REQUEST_ID;
        }
        // Odd ids only; after the stream-id space is exhausted, wrap and
        // probe past ids still in flight.
        loop {
            let id = inner.next_id;
            inner.next_id = if id >= MAX_STREAM_ID { 1 } else { id + 2 };
            if !inner.handles.contains_key(&id) {
                return id;
            }
        }
    }

    /// Runs `f` against the handle stored under `id`, if present.
    pub(crate) fn with_mut<R>(
        &self,
        id: u32,
        f: impl FnOnce(&mut ResponseHandle) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.handles.get_mut(&id).map(f)
    }

    pub(crate) fn remove(&self, id: u32) -> Option<ResponseHandle> {
        self.inner.lock().unwrap().handles.remove(&id)
    }

    /// Fails every outstanding handle with an error from `cause` and
    /// empties the table. Invoked when the connection closes.
    pub(crate) fn clear_with(&self, cause: impl Fn() -> Error) {
        let drained: Vec<ResponseHandle> = {
            let mut inner = self.inner.lock().unwrap();
            inner.handles.drain().map(|(_, h)| h).collect()
        };
        for handle in drained {
            handle.fail(cause());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().handles.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h1_id_is_always_one() {
        let registry = HandleRegistry::new(false);
        assert_eq!(registry.reserve(), 1);
        assert_eq!(registry.reserve(), 1);
    }

    #[test]
    fn h2_ids_are_odd_and_monotonic() {
        let registry = HandleRegistry::new(true);
        assert_eq!(registry.reserve(), 1);
        assert_eq!(registry.reserve(), 3);
        assert_eq!(registry.reserve(), 5);
    }
}
