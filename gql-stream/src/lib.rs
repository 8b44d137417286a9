//! # gql-stream
//!
//! Client side of GraphQL subscriptions over a persistent socket, speaking the
//! `graphql-ws` protocol (`connection_init` / `connection_ack` / `start` /
//! `data` / `error` / `complete` / `stop`).
//!
//! A [`Subscription`] owns one GraphQL request, a per-subscription
//! [`CallbackRegistry`] and at most one running session. Sessions open a
//! channel through any [`ChannelProvider`], perform the handshake, send
//! `start` once the server acknowledges and dispatch every frame addressed to
//! the subscription until a stop event, a transport failure or cancellation.
//!
//! [`SharedChannelProvider`] multiplexes many subscriptions over one socket
//! per endpoint.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gql_stream::{EventKind, Request, Subscription, WebSocketProvider};
//!
//! #[tokio::main]
//! async fn main() {
//!     let subscription = Subscription::new(
//!         Request::new("subscription { ticks { at } }").with_header("Authorization", "Bearer token"),
//!     );
//!
//!     subscription.on_data(|response| async move {
//!         println!("{:?}", response.data());
//!         Ok(())
//!     });
//!     subscription.on(EventKind::Complete, |_event| async { Ok(()) });
//!
//!     subscription.subscribe("ws://localhost:4000/graphql", Arc::new(WebSocketProvider::new()), false);
//!     let state = subscription.wait_finished().await;
//!     println!("subscription ended: {}", state);
//! }
//! ```

pub mod callbacks;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod request;
pub mod session;
pub mod shared;
pub mod subscription;

pub use callbacks::{Callback, CallbackId, CallbackRegistry, DispatchSummary, FnCallback};
pub use config::SubscriptionConfig;
pub use error::{CallbackError, CallbackResult, Result, SubscriptionError};
pub use event::{Event, EventKind, EventPayload};
pub use request::{GraphQLError, Location, Request, Response};
pub use session::SessionOutcome;
pub use shared::SharedChannelProvider;
pub use subscription::{Subscription, SubscriptionState};

// Transport seam, so callers need only one dependency.
pub use socket_channel::{
    Channel, ChannelError, ChannelProvider, ChannelSender, Frame, FrameSink, FrameSource,
    WebSocketConfig, WebSocketProvider,
};

#[cfg(any(test, feature = "test-support"))]
pub use socket_channel::memory;
