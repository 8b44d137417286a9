//! The subscription handle and its lifecycle.
//!
//! A [`Subscription`] is created once per query stream and is reusable:
//! [`subscribe`](Subscription::subscribe) may be called again after an
//! [`unsubscribe`](Subscription::unsubscribe) or after the stream completed,
//! spawning a fresh session with the same id and request.
//!
//! Everything but the running-task handle is immutable after construction.
//! The handle is replaced under a synchronous lock that is never held across
//! an `.await`, so handlers may call `subscribe` or `unsubscribe` on their own
//! subscription without deadlocking.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use socket_channel::ChannelProvider;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::callbacks::{CallbackId, CallbackRegistry};
use crate::config::SubscriptionConfig;
use crate::error::{CallbackResult, Result};
use crate::event::{Event, EventKind};
use crate::request::{Request, Response};
use crate::session::{Session, SessionOutcome};

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Ticket of the session running on the current task, if any.
    static SESSION_TICKET: u64;
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Never subscribed
    Idle,
    /// Opening the channel
    Connecting,
    /// `connection_init` sent, waiting for `connection_ack`
    AwaitingAck,
    /// `start` sent, events flowing
    Streaming,
    /// Ended by a stop event or a clean close
    Terminated,
    /// Ended by an error frame or a transport failure
    Errored,
    /// Ended by local cancellation
    Cancelled,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Terminated | SubscriptionState::Errored | SubscriptionState::Cancelled
        )
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubscriptionState::Idle => "idle",
            SubscriptionState::Connecting => "connecting",
            SubscriptionState::AwaitingAck => "awaiting_ack",
            SubscriptionState::Streaming => "streaming",
            SubscriptionState::Terminated => "terminated",
            SubscriptionState::Errored => "errored",
            SubscriptionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Immutable part of a subscription, shared with its running session.
pub(crate) struct SubscriptionCore {
    id: String,
    request: Arc<Request>,
    callbacks: CallbackRegistry,
    config: SubscriptionConfig,
    state: Arc<watch::Sender<SubscriptionState>>,
    /// Ticket of the latest started run; only it may publish state
    current_run: Arc<AtomicU64>,
}

/// Publishes state on behalf of one run. Silent once a newer run started.
#[derive(Clone)]
pub(crate) struct StatePublisher {
    ticket: u64,
    current_run: Arc<AtomicU64>,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl StatePublisher {
    /// Returns whether the state was published.
    pub(crate) fn publish(&self, state: SubscriptionState) -> bool {
        self.state.send_if_modified(|current| {
            if self.current_run.load(Ordering::Acquire) != self.ticket {
                tracing::trace!("Stale run {} not publishing {}", self.ticket, state);
                return false;
            }
            *current = state;
            true
        })
    }
}

impl SubscriptionCore {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn request_arc(&self) -> &Arc<Request> {
        &self.request
    }

    pub(crate) fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub(crate) fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub(crate) fn publisher(&self, ticket: u64) -> StatePublisher {
        StatePublisher {
            ticket,
            current_run: Arc::clone(&self.current_run),
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn connection_init_frame(&self) -> Value {
        let mut payload = self.config.init_payload.clone();
        payload.insert("headers".to_string(), self.request.headers_json());
        json!({ "type": "connection_init", "payload": payload })
    }

    pub(crate) fn start_frame(&self) -> Value {
        json!({ "id": self.id, "type": "start", "payload": self.request.payload() })
    }

    pub(crate) fn stop_frame(&self) -> Value {
        json!({ "id": self.id, "type": "stop" })
    }

    pub(crate) async fn handle(&self, event: &Event) -> bool {
        if !event.is_addressed_to(&self.id) {
            tracing::trace!(
                "Subscription {} dropping {} frame addressed to {:?}",
                self.id,
                event.kind(),
                event.json().get("id")
            );
            return false;
        }

        tracing::trace!("Subscription {} dispatching {}", self.id, event.kind());
        self.callbacks.dispatch(event.kind(), event).await;
        true
    }
}

/// Resolves once the run behind it has published its terminal state.
pub(crate) type RunFinished = watch::Receiver<Option<SubscriptionState>>;

struct SessionHandle {
    ticket: u64,
    cancel: CancellationToken,
    join: JoinHandle<SessionOutcome>,
    finished: RunFinished,
}

impl SessionHandle {
    /// The session has reported its terminal state or its task has ended.
    fn is_finished(&self) -> bool {
        self.finished.borrow().is_some() || self.join.is_finished()
    }
}

/// Client-side handle for one GraphQL subscription.
///
/// Dropping the handle cancels the running session, which still sends its
/// best-effort `stop` frame.
pub struct Subscription {
    core: Arc<SubscriptionCore>,
    task: Mutex<Runs>,
}

#[derive(Default)]
struct Runs {
    current: Option<SessionHandle>,
    /// Unsubscribed run that may still be sending its `stop`
    retiring: Option<RunFinished>,
}

impl Runs {
    /// Cancel the current run and remember it until it has wound down.
    fn retire(&mut self) -> Option<SessionHandle> {
        let handle = self.current.take()?;
        handle.cancel.cancel();
        self.retiring = Some(handle.finished.clone());
        Some(handle)
    }
}

impl Subscription {
    /// Create a subscription for `request` with the default configuration.
    pub fn new(request: Request) -> Self {
        Self::build(request, SubscriptionConfig::default())
    }

    /// Create a subscription with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Configuration`](crate::SubscriptionError::Configuration)
    /// if the configuration does not validate.
    pub fn with_config(request: Request, config: SubscriptionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(request, config))
    }

    fn build(request: Request, config: SubscriptionConfig) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Idle);
        Self {
            core: Arc::new(SubscriptionCore {
                id: uuid::Uuid::new_v4().to_string(),
                request: Arc::new(request),
                callbacks: CallbackRegistry::new(),
                config,
                state: Arc::new(state),
                current_run: Arc::new(AtomicU64::new(0)),
            }),
            task: Mutex::new(Runs::default()),
        }
    }

    /// The locally generated id, stable for the lifetime of the handle.
    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn request(&self) -> &Request {
        &self.core.request
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.core.config
    }

    /// Event kinds that end the read loop.
    pub fn stop_kinds(&self) -> &HashSet<EventKind> {
        &self.core.config.stop_kinds
    }

    /// The callback registry. Handlers may be added before or while running.
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.core.callbacks
    }

    /// Register an async closure for `kind`.
    pub fn on<F, Fut>(&self, kind: EventKind, f: F) -> CallbackId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.core.callbacks.on(kind, f)
    }

    /// Register an async closure for the response of every `data` event.
    pub fn on_data<F, Fut>(&self, f: F) -> CallbackId
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.core.callbacks.on_response(EventKind::Data, f)
    }

    /// Register an async closure for the response of every `error` event.
    pub fn on_error<F, Fut>(&self, f: F) -> CallbackId
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.core.callbacks.on_response(EventKind::Error, f)
    }

    /// Start streaming from `endpoint` over a channel opened by `provider`.
    ///
    /// Returns `false` without doing anything if a session is already running
    /// and `force` is not set. With `force`, the running session is cancelled
    /// and the new one waits for it to finish before opening its channel. A
    /// run cancelled by `unsubscribe` that is still winding down is waited for
    /// the same way, so its `stop` always goes out before the new `start`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        endpoint: impl Into<String>,
        provider: Arc<dyn ChannelProvider>,
        force: bool,
    ) -> bool {
        let mut runs = self.task.lock();

        if let Some(handle) = runs.current.as_ref() {
            if !handle.is_finished() && !force {
                tracing::debug!("Subscription {} already running", self.id());
                return false;
            }
        }

        runs.retire();
        let previous = runs.retiring.take();

        let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        self.core.current_run.store(ticket, Ordering::Release);
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(None);

        let session = Session {
            core: Arc::clone(&self.core),
            state: self.core.publisher(ticket),
            endpoint: endpoint.into(),
            provider,
            cancel: cancel.clone(),
            previous,
            finished: finished_tx,
        };
        let join = tokio::spawn(SESSION_TICKET.scope(ticket, session.run()));

        runs.current = Some(SessionHandle {
            ticket,
            cancel,
            join,
            finished: finished_rx,
        });
        true
    }

    /// Cancel the running session, if any. Idempotent.
    ///
    /// The session sends its `stop` frame in the background; use
    /// [`unsubscribe_and_wait`](Self::unsubscribe_and_wait) to wait for it.
    pub fn unsubscribe(&self) {
        if self.task.lock().retire().is_some() {
            tracing::debug!("Subscription {} unsubscribed", self.id());
        }
    }

    /// Cancel the running session and wait for it to finish.
    ///
    /// Returns `None` if nothing was running, or when called from inside the
    /// subscription's own session (e.g. from a handler), where waiting would
    /// never complete.
    pub async fn unsubscribe_and_wait(&self) -> Option<SessionOutcome> {
        let handle = self.task.lock().retire()?;

        if SESSION_TICKET.try_with(|ticket| *ticket).ok() == Some(handle.ticket) {
            tracing::debug!(
                "Subscription {} unsubscribed from its own session, not waiting",
                self.id()
            );
            return None;
        }

        match handle.join.await {
            Ok(outcome) => Some(outcome),
            Err(e) => Some(SessionOutcome::Failed(format!("session task failed: {}", e))),
        }
    }

    /// Whether a session has been started and has not finished.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .current
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Whether the last started session has finished on its own.
    pub fn is_complete(&self) -> bool {
        self.task
            .lock()
            .current
            .as_ref()
            .is_some_and(SessionHandle::is_finished)
    }

    pub fn state(&self) -> SubscriptionState {
        *self.core.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.core.state.subscribe()
    }

    /// Wait until the current session reaches a terminal state and return it.
    ///
    /// Returns the current state immediately if nothing was started or the
    /// handle was already cleared by `unsubscribe`.
    pub async fn wait_finished(&self) -> SubscriptionState {
        let finished = self
            .task
            .lock()
            .current
            .as_ref()
            .map(|handle| handle.finished.clone());
        let Some(mut finished) = finished else {
            return self.state();
        };

        let terminal = match finished.wait_for(Option::is_some).await {
            Ok(state) => *state,
            Err(_) => None,
        };
        terminal.unwrap_or_else(|| self.state())
    }

    /// Dispatch `event` if it is connection-scoped or addressed to this
    /// subscription. Returns whether it was dispatched.
    pub async fn handle(&self, event: &Event) -> bool {
        self.core.handle(event).await
    }

    /// The `connection_init` frame: request headers plus configured extras.
    pub fn connection_init_frame(&self) -> Value {
        self.core.connection_init_frame()
    }

    /// The `start` frame carrying this subscription's id and request payload.
    pub fn start_frame(&self) -> Value {
        self.core.start_frame()
    }

    pub fn stop_frame(&self) -> Value {
        self.core.stop_frame()
    }

    /// Whether `event` would end the read loop.
    pub fn is_stop_event(&self, event: &Event) -> bool {
        event.is_addressed_to(self.id()) && self.core.config.is_stop_kind(event.kind())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.get_mut().retire();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.core.id)
            .field("request", &self.core.request)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}
