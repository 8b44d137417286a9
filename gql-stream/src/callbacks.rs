//! Per-subscription callback registry.
//!
//! Handlers are grouped by [`EventKind`] and run in registration order. The
//! registry lock is synchronous and never held across an `.await`: dispatch
//! snapshots the handler list first, so a handler may register or unregister
//! other handlers while it runs.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;

use crate::error::CallbackResult;
use crate::event::{Event, EventKind};
use crate::request::Response;

/// Identifier returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// A handler invoked with each dispatched [`Event`].
///
/// Any data the handler needs besides the event is bound when it is
/// constructed.
#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, event: Event) -> CallbackResult;
}

/// Adapter turning an async closure into a [`Callback`].
pub struct FnCallback<F> {
    f: F,
}

impl<F> FnCallback<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Callback for FnCallback<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = CallbackResult> + Send,
{
    async fn call(&self, event: Event) -> CallbackResult {
        (self.f)(event).await
    }
}

/// What a single dispatch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Handlers that were run
    pub invoked: usize,
    /// Handlers that returned an error or panicked
    pub failed: usize,
}

struct Entry {
    id: CallbackId,
    callback: Arc<dyn Callback>,
    once: bool,
}

/// Mapping from event kind to an ordered list of handlers.
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for `kind`. It runs after every handler already
    /// registered for that kind.
    pub fn register(&self, kind: EventKind, callback: Arc<dyn Callback>) -> CallbackId {
        self.insert(kind, callback, false)
    }

    /// Register `callback` for the next dispatch of `kind` only.
    pub fn register_once(&self, kind: EventKind, callback: Arc<dyn Callback>) -> CallbackId {
        self.insert(kind, callback, true)
    }

    /// Register an async closure for `kind`.
    pub fn on<F, Fut>(&self, kind: EventKind, f: F) -> CallbackId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.register(kind, Arc::new(FnCallback::new(f)))
    }

    /// Register an async closure receiving the [`Response`] of `kind` events.
    ///
    /// Only meaningful for `data` and `error`; events without a response
    /// payload are skipped.
    pub fn on_response<F, Fut>(&self, kind: EventKind, f: F) -> CallbackId
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.on(kind, move |event: Event| {
            let pending = event.response().map(&f);
            async move {
                match pending {
                    Some(fut) => fut.await,
                    None => Ok(()),
                }
            }
        })
    }

    /// Remove a handler. Returns `false` if it was not registered for `kind`.
    pub fn unregister(&self, kind: EventKind, id: CallbackId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(entries) = handlers.get_mut(&kind) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            handlers.remove(&kind);
        }
        removed
    }

    /// Remove every handler for `kind`.
    pub fn clear(&self, kind: EventKind) {
        self.handlers.write().remove(&kind);
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Run every handler registered for `kind`, in registration order.
    ///
    /// Handlers are awaited one at a time. A handler that errors or panics
    /// is logged and counted; the rest still run. Unrecognized kinds never
    /// match a handler.
    pub async fn dispatch(&self, kind: EventKind, event: &Event) -> DispatchSummary {
        if kind == EventKind::Unrecognized {
            tracing::trace!("Ignoring unrecognized frame type {:?}", event.raw_type());
            return DispatchSummary::default();
        }

        let snapshot: Vec<(CallbackId, Arc<dyn Callback>)> = {
            let mut handlers = self.handlers.write();
            let Some(entries) = handlers.get_mut(&kind) else {
                return DispatchSummary::default();
            };

            let snapshot = entries
                .iter()
                .map(|entry| (entry.id, Arc::clone(&entry.callback)))
                .collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                handlers.remove(&kind);
            }
            snapshot
        };

        let mut summary = DispatchSummary::default();
        for (id, callback) in snapshot {
            summary.invoked += 1;

            match AssertUnwindSafe(callback.call(event.clone()))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    summary.failed += 1;
                    tracing::warn!("Callback {} for {} failed: {}", id, kind, e);
                }
                Err(panic) => {
                    summary.failed += 1;
                    tracing::warn!(
                        "Callback {} for {} panicked: {}",
                        id,
                        kind,
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        summary
    }

    fn insert(&self, kind: EventKind, callback: Arc<dyn Callback>, once: bool) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Entry { id, callback, once });
        id
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<EventKind, usize> = handlers
            .iter()
            .map(|(kind, entries)| (*kind, entries.len()))
            .collect();
        f.debug_struct("CallbackRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
