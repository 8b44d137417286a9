//! Channel abstraction shared by every transport.
//!
//! A [`Channel`] is split into two halves from the start:
//!
//! - [`ChannelSender`]: a cloneable handle that serializes writers behind a
//!   mutex, so several tasks can enqueue frames on one connection.
//! - [`FrameSource`]: the read half, owned by exactly one task.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{ChannelError, Result};

/// One inbound message as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text message
    Text(String),
    /// A binary message
    Binary(Vec<u8>),
    /// A transport-level ping
    Ping,
    /// A transport-level pong
    Pong,
    /// The peer closed the connection cleanly
    Close,
}

impl Frame {
    /// Get the text content if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text message.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the write half. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next inbound frame.
    ///
    /// Returns `None` once the channel has been closed cleanly and
    /// `Some(Err(_))` when the transport failed. Implementations must be
    /// cancel-safe: dropping the returned future must not lose a frame.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Cloneable, writer-serializing handle to the write half of a channel.
#[derive(Clone)]
pub struct ChannelSender {
    sink: Arc<Mutex<Box<dyn FrameSink>>>,
}

impl ChannelSender {
    /// Wrap a sink.
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Encode `value` as JSON text and send it.
    pub async fn send_json(&self, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    /// Send a raw text message.
    pub async fn send_text(&self, text: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send_text(text).await
    }

    /// Close the write half.
    pub async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender").finish_non_exhaustive()
    }
}

/// An open bidirectional channel.
pub struct Channel {
    sender: ChannelSender,
    source: Box<dyn FrameSource>,
}

impl Channel {
    /// Assemble a channel from its two halves.
    pub fn new(sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self {
            sender: ChannelSender::new(sink),
            source,
        }
    }

    /// Get the write handle.
    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Read the next frame.
    pub async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.source.next_frame().await
    }

    /// Split into the write handle and the read half.
    pub fn into_parts(self) -> (ChannelSender, Box<dyn FrameSource>) {
        (self.sender, self.source)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Opens channels to an endpoint.
///
/// Implementations decide whether every call dials a new connection or hands
/// out a view of an existing one.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Open a channel to `endpoint`.
    async fn open(&self, endpoint: &str) -> std::result::Result<Channel, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        written: Arc<StdMutex<Vec<String>>>,
        closed: bool,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> Result<()> {
            if self.closed {
                return Err(ChannelError::Closed);
            }
            self.written.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn test_frame_as_text() {
        assert_eq!(Frame::Text("hi".to_string()).as_text(), Some("hi"));
        assert_eq!(Frame::Binary(vec![1, 2]).as_text(), None);
        assert_eq!(Frame::Close.as_text(), None);
    }

    #[tokio::test]
    async fn test_sender_encodes_json_and_serializes_clones() {
        let written = Arc::new(StdMutex::new(Vec::new()));
        let sender = ChannelSender::new(Box::new(RecordingSink {
            written: Arc::clone(&written),
            closed: false,
        }));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let sender = sender.clone();
                tokio::spawn(async move { sender.send_json(&serde_json::json!({ "n": i })).await })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 5);
        for text in written.iter() {
            let value: Value = serde_json::from_str(text).unwrap();
            assert!(value["n"].is_u64());
        }
    }

    #[tokio::test]
    async fn test_sender_after_close() {
        let sender = ChannelSender::new(Box::new(RecordingSink {
            written: Arc::new(StdMutex::new(Vec::new())),
            closed: false,
        }));

        sender.close().await.unwrap();
        let result = sender.send_text("late".to_string()).await;
        assert_eq!(result, Err(ChannelError::Closed));
    }
}
