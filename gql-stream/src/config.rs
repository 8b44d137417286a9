//! Configuration types for the gql-stream crate
//!
//! This module defines the policy knobs of a subscription: which event kinds
//! end the read loop, how long the farewell `stop` may take, and what goes
//! into the `connection_init` payload besides the request headers.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{Result, SubscriptionError};
use crate::event::EventKind;

/// Configuration for a [`Subscription`](crate::Subscription)
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Event kinds that end the read loop once delivered
    /// Default: error, connection_error, complete
    pub stop_kinds: HashSet<EventKind>,

    /// Upper bound on the best-effort `stop` send during cancellation
    /// Default: 2 seconds
    pub stop_timeout: Duration,

    /// Upper bound on opening the channel, if any
    /// Default: none (the protocol has no intrinsic timeouts)
    pub open_timeout: Option<Duration>,

    /// Extra members merged into the `connection_init` payload next to `headers`
    /// Default: empty
    pub init_payload: Map<String, Value>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            stop_kinds: Self::default_stop_kinds(),
            stop_timeout: Duration::from_secs(2),
            open_timeout: None,
            init_payload: Map::new(),
        }
    }
}

impl SubscriptionConfig {
    /// Create a SubscriptionConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// The default stop kinds: error, connection_error and complete.
    pub fn default_stop_kinds() -> HashSet<EventKind> {
        [
            EventKind::Error,
            EventKind::ConnectionError,
            EventKind::Complete,
        ]
        .into_iter()
        .collect()
    }

    /// Create a SubscriptionConfig that also ends on `connection_terminate`
    pub fn terminate_on_connection_terminate() -> Self {
        Self::default().with_stop_kind(EventKind::ConnectionTerminate)
    }

    /// Create a SubscriptionConfig that only ends on `complete`, delivering
    /// `error` frames without stopping
    pub fn tolerate_errors() -> Self {
        Self::default()
            .without_stop_kind(EventKind::Error)
            .without_stop_kind(EventKind::ConnectionError)
    }

    pub fn with_stop_kind(mut self, kind: EventKind) -> Self {
        self.stop_kinds.insert(kind);
        self
    }

    pub fn without_stop_kind(mut self, kind: EventKind) -> Self {
        self.stop_kinds.remove(&kind);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    /// Add a member to the `connection_init` payload. `headers` is reserved
    /// for the request headers and is overwritten when the frame is built.
    pub fn with_init_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.init_payload.insert(name.into(), value.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stop_timeout.is_zero() {
            return Err(SubscriptionError::Configuration(
                "stop_timeout must be greater than 0".to_string(),
            ));
        }

        if self.open_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(SubscriptionError::Configuration(
                "open_timeout must be greater than 0 when set".to_string(),
            ));
        }

        for kind in &self.stop_kinds {
            if kind.is_outbound_only() || *kind == EventKind::Unrecognized {
                return Err(SubscriptionError::Configuration(format!(
                    "{} can never be received and cannot be a stop kind",
                    kind
                )));
            }
        }

        Ok(())
    }

    /// Whether `kind` ends the read loop.
    pub fn is_stop_kind(&self, kind: EventKind) -> bool {
        self.stop_kinds.contains(&kind)
    }
}
