//! Generic bidirectional frame channel for gql-sdk.
//!
//! This crate provides the transport seam consumed by the subscription
//! protocol crate. It has no knowledge of GraphQL: it moves text frames in
//! and out and reports a terminal error distinctly from a clean close.
//!
//! # Overview
//!
//! - [`ChannelProvider`]: opens a [`Channel`] to an endpoint.
//! - [`Channel`]: a [`ChannelSender`] (cloneable, writers serialized) plus a
//!   single-owner read half yielding [`Frame`]s.
//! - [`WebSocketProvider`]: tokio-tungstenite implementation that offers the
//!   `graphql-ws` subprotocol by default.
//! - `memory` (feature `test-support`): scripted in-memory channels.
//!
//! # Example
//!
//! ```no_run
//! use socket_channel::{ChannelProvider, Frame, WebSocketProvider};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), socket_channel::ChannelError> {
//!     let provider = WebSocketProvider::new();
//!     let mut channel = provider.open("ws://localhost:4000/graphql").await?;
//!
//!     channel
//!         .sender()
//!         .send_json(&serde_json::json!({ "type": "connection_init", "payload": {} }))
//!         .await?;
//!
//!     while let Some(frame) = channel.next_frame().await {
//!         if let Frame::Text(text) = frame? {
//!             println!("{}", text);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod websocket;

pub use channel::{Channel, ChannelProvider, ChannelSender, Frame, FrameSink, FrameSource};
pub use error::{ChannelError, Result};
pub use websocket::{validate_endpoint, WebSocketConfig, WebSocketProvider, GRAPHQL_WS_SUBPROTOCOL};
