//! In-memory channel for tests and demos.
//!
//! [`MemoryChannel::pair`] returns a [`Channel`] plus the [`MemoryPeer`] that
//! plays the server: the peer scripts inbound frames and observes everything
//! the client wrote. [`MemoryProvider`] hands out queued channels from
//! [`ChannelProvider::open`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelProvider, Frame, FrameSink, FrameSource};
use crate::error::{ChannelError, Result};

/// Constructor namespace for in-memory channels.
pub struct MemoryChannel;

impl MemoryChannel {
    /// Create a connected channel and its scripted peer.
    pub fn pair() -> (Channel, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(Mutex::new(false));

        let channel = Channel::new(
            Box::new(MemorySink {
                outbound: outbound_tx,
                closed: Arc::clone(&closed),
            }),
            Box::new(MemorySource { inbound: inbound_rx }),
        );

        let peer = MemoryPeer {
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
            client_closed: closed,
        };

        (channel, peer)
    }
}

/// Server side of an in-memory channel.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<Frame>>>,
    outbound: mpsc::UnboundedReceiver<String>,
    client_closed: Arc<Mutex<bool>>,
}

impl MemoryPeer {
    /// Queue an inbound frame. Returns `false` if the reader is gone.
    pub fn push(&self, frame: Frame) -> bool {
        match &self.inbound {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    /// Queue a JSON value as an inbound text frame.
    pub fn push_json(&self, value: Value) -> bool {
        self.push(Frame::Text(value.to_string()))
    }

    /// Queue a terminal transport error.
    pub fn fail(&self, error: ChannelError) -> bool {
        match &self.inbound {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// End the inbound stream cleanly, as if the server hung up.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Wait for the next outbound text written by the client.
    pub async fn next_outbound(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Wait for the next outbound message and decode it as JSON.
    pub async fn next_outbound_json(&mut self) -> Option<Value> {
        let text = self.next_outbound().await?;
        serde_json::from_str(&text).ok()
    }

    /// Like [`next_outbound_json`](Self::next_outbound_json) but gives up
    /// after `limit`.
    pub async fn next_outbound_json_within(&mut self, limit: Duration) -> Option<Value> {
        tokio::time::timeout(limit, self.next_outbound_json())
            .await
            .ok()
            .flatten()
    }

    /// Drain everything written so far without waiting.
    pub fn drain_outbound(&mut self) -> Vec<String> {
        let mut drained = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            drained.push(text);
        }
        drained
    }

    /// Whether the client closed its write half.
    pub fn client_closed(&self) -> bool {
        *self.client_closed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MemorySink {
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(text)
            .map_err(|_| ChannelError::Send("peer dropped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
        Ok(())
    }
}

struct MemorySource {
    inbound: mpsc::UnboundedReceiver<Result<Frame>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await
    }
}

/// Provider handing out pre-built channels in FIFO order.
#[derive(Default)]
pub struct MemoryProvider {
    channels: Mutex<VecDeque<Channel>>,
    endpoints: Mutex<Vec<String>>,
}

impl MemoryProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a fresh channel and return its peer.
    pub fn push_pair(&self) -> MemoryPeer {
        let (channel, peer) = MemoryChannel::pair();
        self.push_channel(channel);
        peer
    }

    /// Queue an existing channel.
    pub fn push_channel(&self, channel: Channel) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(channel);
    }

    /// Endpoints passed to `open`, in call order.
    pub fn opened_endpoints(&self) -> Vec<String> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    async fn open(&self, endpoint: &str) -> Result<Channel> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(endpoint.to_string());

        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| ChannelError::Connect(format!("no channel queued for {}", endpoint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_round_trip() {
        let (mut channel, mut peer) = MemoryChannel::pair();

        channel
            .sender()
            .send_json(&json!({ "type": "connection_init" }))
            .await
            .unwrap();
        assert_eq!(
            peer.next_outbound_json().await,
            Some(json!({ "type": "connection_init" }))
        );

        assert!(peer.push_json(json!({ "type": "connection_ack" })));
        let frame = channel.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.as_text(), Some(r#"{"type":"connection_ack"}"#));
    }

    #[tokio::test]
    async fn test_hang_up_ends_stream() {
        let (mut channel, mut peer) = MemoryChannel::pair();
        peer.push(Frame::Ping);
        peer.hang_up();

        assert_eq!(channel.next_frame().await, Some(Ok(Frame::Ping)));
        assert_eq!(channel.next_frame().await, None);
    }

    #[tokio::test]
    async fn test_fail_surfaces_error() {
        let (mut channel, peer) = MemoryChannel::pair();
        peer.fail(ChannelError::Transport("reset".to_string()));

        assert_eq!(
            channel.next_frame().await,
            Some(Err(ChannelError::Transport("reset".to_string())))
        );
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_sends() {
        let (channel, peer) = MemoryChannel::pair();
        channel.sender().close().await.unwrap();

        assert!(peer.client_closed());
        assert_eq!(
            channel.sender().send_text("x".to_string()).await,
            Err(ChannelError::Closed)
        );
    }

    #[test]
    fn test_provider_hands_out_in_order() {
        tokio_test::block_on(async {
            let provider = MemoryProvider::new();
            let _first = provider.push_pair();
            let _second = provider.push_pair();

            assert!(provider.open("ws://a").await.is_ok());
            assert!(provider.open("ws://b").await.is_ok());
            assert!(matches!(
                provider.open("ws://c").await,
                Err(ChannelError::Connect(_))
            ));
            assert_eq!(
                provider.opened_endpoints(),
                vec!["ws://a".to_string(), "ws://b".to_string(), "ws://c".to_string()]
            );
        });
    }
}
