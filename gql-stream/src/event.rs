//! Classification of inbound frames into typed events.

use std::sync::Arc;

use serde_json::Value;

use crate::request::{Request, Response};

/// Frame `type` tags of the subscription protocol.
///
/// Unknown or missing tags classify to [`EventKind::Unrecognized`] instead of
/// failing, so a stray frame can never abort a read loop.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventKind {
    ConnectionInit,
    ConnectionAck,
    ConnectionError,
    ConnectionTerminate,
    Start,
    Data,
    Error,
    Complete,
    Stop,
    /// `ka` keep-alive
    KeepAlive,
    /// Any `type` value outside the protocol vocabulary
    Unrecognized,
}

impl EventKind {
    /// Every recognized kind, in protocol order.
    pub const ALL: [EventKind; 10] = [
        EventKind::ConnectionInit,
        EventKind::ConnectionAck,
        EventKind::ConnectionError,
        EventKind::ConnectionTerminate,
        EventKind::Start,
        EventKind::Data,
        EventKind::Error,
        EventKind::Complete,
        EventKind::Stop,
        EventKind::KeepAlive,
    ];

    /// Parse a wire `type` value. Never fails.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("connection_init") => EventKind::ConnectionInit,
            Some("connection_ack") => EventKind::ConnectionAck,
            Some("connection_error") => EventKind::ConnectionError,
            Some("connection_terminate") => EventKind::ConnectionTerminate,
            Some("start") => EventKind::Start,
            Some("data") => EventKind::Data,
            Some("error") => EventKind::Error,
            Some("complete") => EventKind::Complete,
            Some("stop") => EventKind::Stop,
            Some("ka") => EventKind::KeepAlive,
            _ => EventKind::Unrecognized,
        }
    }

    /// The wire value, or `None` for [`EventKind::Unrecognized`].
    pub fn as_str(&self) -> Option<&'static str> {
        let value = match self {
            EventKind::ConnectionInit => "connection_init",
            EventKind::ConnectionAck => "connection_ack",
            EventKind::ConnectionError => "connection_error",
            EventKind::ConnectionTerminate => "connection_terminate",
            EventKind::Start => "start",
            EventKind::Data => "data",
            EventKind::Error => "error",
            EventKind::Complete => "complete",
            EventKind::Stop => "stop",
            EventKind::KeepAlive => "ka",
            EventKind::Unrecognized => return None,
        };
        Some(value)
    }

    /// Kinds only ever sent by the client.
    pub fn is_outbound_only(&self) -> bool {
        matches!(
            self,
            EventKind::ConnectionInit | EventKind::Start | EventKind::Stop
        )
    }

    /// Whether an event of this kind carries a GraphQL response payload.
    pub fn carries_response(&self) -> bool {
        matches!(self, EventKind::Data | EventKind::Error)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str().unwrap_or("<unrecognized>"))
    }
}

/// Payload of an [`Event`], reinterpreted according to its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// `data` and `error` payloads, tied to the owning request
    Response(Response),
    /// Every other kind, passed through unchanged
    Raw(Value),
}

impl EventPayload {
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            EventPayload::Response(response) => Some(response),
            EventPayload::Raw(_) => None,
        }
    }

    /// The underlying JSON regardless of variant.
    pub fn json(&self) -> &Value {
        match self {
            EventPayload::Response(response) => response.json(),
            EventPayload::Raw(value) => value,
        }
    }
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    subscription_id: Option<String>,
    kind: EventKind,
    json: Value,
    request: Arc<Request>,
}

impl Event {
    /// Classify a decoded frame on behalf of the subscription `subscription_id`.
    pub fn classify(
        subscription_id: impl Into<String>,
        request: Arc<Request>,
        json: Value,
    ) -> Self {
        let kind = EventKind::parse(json.get("type").and_then(Value::as_str));
        Self {
            subscription_id: Some(subscription_id.into()),
            kind,
            json,
            request,
        }
    }

    /// Build an event with no owning subscription, e.g. when replaying frames.
    pub fn unowned(request: Arc<Request>, json: Value) -> Self {
        let kind = EventKind::parse(json.get("type").and_then(Value::as_str));
        Self {
            subscription_id: None,
            kind,
            json,
            request,
        }
    }

    /// The `id` carried by the frame envelope.
    pub fn id(&self) -> Option<&str> {
        self.json.get("id").and_then(Value::as_str)
    }

    /// The locally tracked subscription that received the frame.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// The `type` string exactly as received.
    pub fn raw_type(&self) -> Option<&str> {
        self.json.get("type").and_then(Value::as_str)
    }

    /// The whole decoded frame.
    pub fn json(&self) -> &Value {
        &self.json
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// The frame payload.
    ///
    /// `data` and `error` payloads become a [`Response`]; every other kind
    /// yields the raw value, even if its shape looks like a response.
    pub fn payload(&self) -> Option<EventPayload> {
        let payload = self.json.get("payload")?;
        if payload.is_null() {
            return None;
        }

        if self.kind.carries_response() {
            Some(EventPayload::Response(Response::new(
                Arc::clone(&self.request),
                payload.clone(),
            )))
        } else {
            Some(EventPayload::Raw(payload.clone()))
        }
    }

    /// The payload as a [`Response`], for `data` and `error` events.
    pub fn response(&self) -> Option<Response> {
        match self.payload()? {
            EventPayload::Response(response) => Some(response),
            EventPayload::Raw(_) => None,
        }
    }

    /// Whether the frame is connection-scoped or addressed to `subscription_id`.
    pub fn is_addressed_to(&self, subscription_id: &str) -> bool {
        match self.json.get("id") {
            None | Some(Value::Null) => true,
            Some(Value::String(id)) => id == subscription_id,
            Some(_) => false,
        }
    }
}
