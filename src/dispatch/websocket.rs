//! WebSocket sink transport on top of tokio-tungstenite.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::{CodecRegistry, Serializer};
use crate::config::ConfigError;
use crate::message::{Message, Payload};

use super::connection::{Connection, ConnectionManager, Connector, Frame};
use super::{DeliveryError, Transport};

const SUPPORTED_SCHEMES: &[&str] = &["ws", "wss"];

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Validated settings of a WebSocket sink
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSinkOptions {
    pub url: String,
    pub serializer: Option<String>,
}

impl WebSocketSinkOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            serializer: None,
        }
    }

    /// Parse the URL and check its scheme
    pub fn target(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::UnsupportedScheme {
                transport: "websocket",
                url: self.url.clone(),
            });
        }
        Ok(url)
    }
}

/// Opens client WebSocket connections to one URL
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Connection = WebSocketConnection;

    fn target(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Arc<WebSocketConnection>, DeliveryError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| DeliveryError::Connect {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!("Connected to {}", self.url);
        Ok(Arc::new(WebSocketConnection::start(socket, self.url.clone())))
    }
}

/// One client WebSocket connection.
///
/// Writes are serialized through the sink half; a reader task drains the
/// peer's frames and marks the connection closed when the peer goes away.
pub struct WebSocketConnection {
    url: String,
    sink: Mutex<SplitSink<Socket, WsMessage>>,
    closed: Arc<watch::Sender<bool>>,
}

impl WebSocketConnection {
    fn start(socket: Socket, url: String) -> Self {
        let (sink, stream) = socket.split();
        let closed = Arc::new(watch::channel(false).0);
        tokio::spawn(read_until_closed(stream, Arc::clone(&closed), url.clone()));

        Self {
            url,
            sink: Mutex::new(sink),
            closed,
        }
    }
}

async fn read_until_closed(mut stream: SplitStream<Socket>, closed: Arc<watch::Sender<bool>>, url: String) {
    let mut done = closed.subscribe();
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("WebSocket to {} failed: {}", url, e);
                    break;
                }
            },
            _ = done.wait_for(|closed| *closed) => return,
        }
    }
    closed.send_replace(true);
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn write(&self, frame: Frame) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed(self.url.clone()));
        }

        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(bytes) => WsMessage::Binary(bytes),
        };
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(|e| {
            self.closed.send_replace(true);
            DeliveryError::Write {
                url: self.url.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!("Closing WebSocket to {} failed: {}", self.url, e);
        }
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

pub struct WebSocketTransport {
    url: String,
    serializer: Arc<dyn Serializer>,
    connections: ConnectionManager<WebSocketConnector>,
}

impl WebSocketTransport {
    pub fn new(options: WebSocketSinkOptions, codecs: &CodecRegistry) -> Result<Self, ConfigError> {
        options.target()?;
        let serializer = codecs
            .serializer(options.serializer.as_deref())
            .map_err(|_| ConfigError::UnknownSerializer(options.serializer.clone().unwrap_or_default()))?;

        Ok(Self {
            connections: ConnectionManager::new(WebSocketConnector::new(options.url.clone())),
            url: options.url,
            serializer,
        })
    }

    pub fn connections(&self) -> &ConnectionManager<WebSocketConnector> {
        &self.connections
    }
}

/// Raw payloads travel as binary frames, everything else as text when it is valid UTF-8
fn frame_for(payload: &Payload, bytes: Vec<u8>) -> Frame {
    match payload {
        Payload::Bytes(_) => Frame::Binary(bytes),
        _ => match String::from_utf8(bytes) {
            Ok(text) => Frame::Text(text),
            Err(e) => Frame::Binary(e.into_bytes()),
        },
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn target(&self) -> &str {
        &self.url
    }

    async fn send(&self, message: &Message) -> Result<(), DeliveryError> {
        let bytes = self.serializer.serialize(message.payload())?;
        self.connections.send(frame_for(message.payload(), bytes)).await
    }
}
