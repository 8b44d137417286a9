//! WebSocket transport built on tokio-tungstenite.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::channel::{Channel, ChannelProvider, Frame, FrameSink, FrameSource};
use crate::error::{ChannelError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subprotocol spoken by the legacy `subscriptions-transport-ws` servers.
pub const GRAPHQL_WS_SUBPROTOCOL: &str = "graphql-ws";

/// Configuration for [`WebSocketProvider`].
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Value offered in `Sec-WebSocket-Protocol`, if any
    /// Default: `graphql-ws`
    pub subprotocol: Option<String>,

    /// Extra HTTP headers sent with the upgrade request
    /// Default: none
    pub headers: Vec<(String, String)>,

    /// Upper bound on the TCP connect plus upgrade handshake
    /// Default: none
    pub connect_timeout: Option<Duration>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            subprotocol: Some(GRAPHQL_WS_SUBPROTOCOL.to_string()),
            headers: Vec::new(),
            connect_timeout: None,
        }
    }
}

impl WebSocketConfig {
    /// Add an HTTP header to the upgrade request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set or clear the offered subprotocol.
    pub fn with_subprotocol(mut self, subprotocol: Option<String>) -> Self {
        self.subprotocol = subprotocol;
        self
    }
}

/// Check that `endpoint` is an absolute `ws://` or `wss://` URL with a host.
pub fn validate_endpoint(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint.trim())
        .map_err(|e| ChannelError::InvalidEndpoint(format!("'{}': {}", endpoint, e)))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(ChannelError::InvalidEndpoint(format!(
                "'{}' must use ws:// or wss:// (found '{}')",
                endpoint, other
            )));
        }
    }

    if url.host_str().is_none() {
        return Err(ChannelError::InvalidEndpoint(format!(
            "'{}' must include a host",
            endpoint
        )));
    }

    Ok(url)
}

/// Dials one WebSocket connection per [`ChannelProvider::open`] call.
#[derive(Debug, Clone, Default)]
pub struct WebSocketProvider {
    config: WebSocketConfig,
}

impl WebSocketProvider {
    /// Create a provider with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider with a custom configuration.
    pub fn with_config(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Get the provider configuration.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    async fn connect(&self, url: Url) -> Result<WsStream> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(subprotocol) = &self.config.subprotocol {
            let value = HeaderValue::from_str(subprotocol)
                .map_err(|e| ChannelError::Connect(format!("Invalid subprotocol: {}", e)))?;
            headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ChannelError::Connect(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ChannelError::Connect(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let handshake = connect_async(request);
        let (stream, _response) = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| ChannelError::Timeout(format!("connect after {:?}", limit)))?,
            None => handshake.await,
        }
        .map_err(|e| ChannelError::Connect(e.to_string()))?;

        Ok(stream)
    }
}

#[async_trait]
impl ChannelProvider for WebSocketProvider {
    async fn open(&self, endpoint: &str) -> Result<Channel> {
        let url = validate_endpoint(endpoint)?;
        tracing::debug!("Opening websocket to {}", url);

        let stream = self.connect(url).await?;
        let (sink, source) = stream.split();

        Ok(Channel::new(
            Box::new(WebSocketSink { sink, closed: false }),
            Box::new(WebSocketSource { stream: source }),
        ))
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink
            .close()
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

struct WebSocketSource {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            };

            let frame = match message {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Binary(data) => Frame::Binary(data.to_vec()),
                Message::Ping(_) => Frame::Ping,
                Message::Pong(_) => Frame::Pong,
                Message::Close(_) => Frame::Close,
                // Raw frames never surface while reading
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}
