//! One run of a subscription over one channel.
//!
//! A session opens its channel, performs the handshake and then reads frames
//! until a stop-kind event, a transport failure, a clean close or
//! cancellation. The read is the only network suspension point; each event is
//! fully dispatched before the next read.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use socket_channel::{ChannelError, ChannelProvider, ChannelSender, Frame, FrameSource};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::callbacks::{Callback, CallbackId};
use crate::error::CallbackResult;
use crate::event::{Event, EventKind};
use crate::subscription::{RunFinished, StatePublisher, SubscriptionCore, SubscriptionState};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A configured stop kind other than an error was received
    Completed(EventKind),
    /// The server reported an error or the transport failed
    Failed(String),
    /// The channel was closed without a stop event
    Closed,
    /// The session was cancelled locally
    Cancelled,
}

impl SessionOutcome {
    /// The terminal [`SubscriptionState`] this outcome leaves behind.
    pub fn final_state(&self) -> SubscriptionState {
        match self {
            SessionOutcome::Completed(_) | SessionOutcome::Closed => SubscriptionState::Terminated,
            SessionOutcome::Failed(_) => SubscriptionState::Errored,
            SessionOutcome::Cancelled => SubscriptionState::Cancelled,
        }
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::Completed(kind) => write!(f, "completed on {}", kind),
            SessionOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            SessionOutcome::Closed => write!(f, "closed by peer"),
            SessionOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Sends `start` when the server acknowledges the connection.
///
/// Registered once on `connection_ack` for the duration of a session; this is
/// the only path that ever sends `start`.
struct StartSender {
    subscription_id: String,
    sender: ChannelSender,
    frame: Value,
    state: StatePublisher,
}

#[async_trait]
impl Callback for StartSender {
    async fn call(&self, _event: Event) -> CallbackResult {
        self.sender.send_json(&self.frame).await?;
        self.state.publish(SubscriptionState::Streaming);
        tracing::debug!("Subscription {} started", self.subscription_id);
        Ok(())
    }
}

/// Everything a spawned session needs.
pub(crate) struct Session {
    pub(crate) core: Arc<SubscriptionCore>,
    pub(crate) state: StatePublisher,
    pub(crate) endpoint: String,
    pub(crate) provider: Arc<dyn ChannelProvider>,
    pub(crate) cancel: CancellationToken,
    /// Run this one replaces; awaited before opening
    pub(crate) previous: Option<RunFinished>,
    /// Per-run terminal state, observed by `wait_finished`
    pub(crate) finished: watch::Sender<Option<SubscriptionState>>,
}

impl Session {
    pub(crate) async fn run(mut self) -> SessionOutcome {
        if let Some(mut previous) = self.previous.take() {
            // A dropped sender means the previous task is gone
            if previous.wait_for(Option::is_some).await.is_err() {
                tracing::debug!(
                    "Previous run of subscription {} ended abnormally",
                    self.core.id()
                );
            }
        }

        let outcome = self.execute().await;

        let state = outcome.final_state();
        self.state.publish(state);
        self.finished.send_replace(Some(state));
        tracing::debug!("Subscription {} {}", self.core.id(), outcome);
        outcome
    }

    async fn execute(&self) -> SessionOutcome {
        if self.cancel.is_cancelled() {
            return SessionOutcome::Cancelled;
        }

        let core = &self.core;
        self.state.publish(SubscriptionState::Connecting);
        tracing::debug!("Subscription {} connecting to {}", core.id(), self.endpoint);

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return SessionOutcome::Cancelled,
            opened = self.open_channel() => opened,
        };

        let (sender, source) = match opened {
            Ok(channel) => channel.into_parts(),
            Err(e) => {
                tracing::debug!("Subscription {} failed to open channel: {}", core.id(), e);
                return SessionOutcome::Failed(e.to_string());
            }
        };

        let start_sender = core.callbacks().register_once(
            EventKind::ConnectionAck,
            Arc::new(StartSender {
                subscription_id: core.id().to_string(),
                sender: sender.clone(),
                frame: core.start_frame(),
                state: self.state.clone(),
            }),
        );

        let outcome = self.drive(&sender, source, start_sender).await;

        core.callbacks().unregister(EventKind::ConnectionAck, start_sender);
        if let Err(e) = sender.close().await {
            tracing::trace!("Closing channel of subscription {}: {}", core.id(), e);
        }

        outcome
    }

    async fn open_channel(&self) -> Result<socket_channel::Channel, ChannelError> {
        let opening = self.provider.open(&self.endpoint);
        match self.core.config().open_timeout {
            Some(limit) => tokio::time::timeout(limit, opening)
                .await
                .unwrap_or_else(|_| {
                    Err(ChannelError::Timeout(format!(
                        "opening {} took longer than {:?}",
                        self.endpoint, limit
                    )))
                }),
            None => opening.await,
        }
    }

    async fn drive(
        &self,
        sender: &ChannelSender,
        mut source: Box<dyn FrameSource>,
        start_sender: CallbackId,
    ) -> SessionOutcome {
        let core = &self.core;

        if let Err(e) = sender.send_json(&core.connection_init_frame()).await {
            return SessionOutcome::Failed(e.to_string());
        }
        self.state.publish(SubscriptionState::AwaitingAck);
        tracing::debug!(
            "Subscription {} sent connection_init (start sender {})",
            core.id(),
            start_sender
        );

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.send_stop(sender).await;
                    return SessionOutcome::Cancelled;
                }
                frame = source.next_frame() => frame,
            };

            let text = match frame {
                Some(Ok(Frame::Text(text))) => text,
                Some(Ok(Frame::Close)) | None => return SessionOutcome::Closed,
                Some(Ok(other)) => {
                    tracing::trace!("Subscription {} ignoring {:?}", core.id(), other);
                    continue;
                }
                Some(Err(e)) => {
                    tracing::debug!("Subscription {} transport failed: {}", core.id(), e);
                    return SessionOutcome::Failed(e.to_string());
                }
            };

            let json: Value = match serde_json::from_str(&text) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(
                        "Subscription {} skipping undecodable frame: {}",
                        core.id(),
                        e
                    );
                    continue;
                }
            };

            let event = Event::classify(core.id(), Arc::clone(core.request_arc()), json);
            if !core.handle(&event).await {
                continue;
            }

            if core.config().is_stop_kind(event.kind()) {
                return match event.kind() {
                    EventKind::Error | EventKind::ConnectionError => {
                        let payload = event
                            .json()
                            .get("payload")
                            .map(Value::to_string)
                            .unwrap_or_default();
                        SessionOutcome::Failed(format!("{} frame: {}", event.kind(), payload))
                    }
                    kind => SessionOutcome::Completed(kind),
                };
            }
        }
    }

    /// Best-effort farewell. Failures are expected when the peer is already
    /// gone and are swallowed.
    async fn send_stop(&self, sender: &ChannelSender) {
        let core = &self.core;
        let stop = core.stop_frame();
        match tokio::time::timeout(core.config().stop_timeout, sender.send_json(&stop)).await {
            Ok(Ok(())) => tracing::debug!("Subscription {} sent stop", core.id()),
            Ok(Err(e)) => tracing::debug!("Subscription {} could not send stop: {}", core.id(), e),
            Err(_) => tracing::debug!("Subscription {} timed out sending stop", core.id()),
        }
    }
}
