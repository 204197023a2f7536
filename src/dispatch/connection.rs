//! Lazily established, shared outbound connection.
//!
//! A [`ConnectionManager`] holds at most one current connection in an
//! atomically swappable slot. Sends reuse it while it is open and reconnect
//! otherwise. When two sends race to connect, the first connection installed
//! wins; the loser closes its own connection and writes through the winner's.

use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};
use async_trait::async_trait;

use super::DeliveryError;

/// One outgoing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An open connection to the remote peer
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Write one frame; resolves once the frame is flushed
    async fn write(&self, frame: Frame) -> Result<(), DeliveryError>;

    fn is_closed(&self) -> bool;

    async fn close(&self);

    /// Resolves once the connection is closed, by either side
    async fn closed(&self);
}

/// Opens new connections to the remote peer
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn target(&self) -> &str;

    async fn connect(&self) -> Result<Arc<Self::Connection>, DeliveryError>;
}

pub struct ConnectionManager<C: Connector> {
    connector: C,
    current: Arc<ArcSwapOption<C::Connection>>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            current: Arc::new(ArcSwapOption::empty()),
        }
    }

    pub fn target(&self) -> &str {
        self.connector.target()
    }

    /// The connection currently installed, if any
    pub fn current(&self) -> Option<Arc<C::Connection>> {
        self.current.load_full()
    }

    /// Connect if needed, then write. Both steps form one retryable unit.
    pub async fn send(&self, frame: Frame) -> Result<(), DeliveryError> {
        let connection = self.connection().await?;
        tracing::debug!("Sending {} bytes to {}", frame.len(), self.target());
        connection.write(frame).await
    }

    /// Return the open current connection, connecting when there is none
    pub async fn connection(&self) -> Result<Arc<C::Connection>, DeliveryError> {
        let mut expected = self.current.load_full();
        if let Some(connection) = open(&expected) {
            tracing::debug!("Reusing connection to {}", self.target());
            return Ok(connection);
        }

        tracing::debug!("Opening a new connection to {}", self.target());
        let fresh = self.connector.connect().await?;

        loop {
            let previous = Guard::into_inner(
                self.current
                    .compare_and_swap(&expected, Some(Arc::clone(&fresh))),
            );

            if same(&previous, &expected) {
                self.watch_close(Arc::clone(&fresh));
                if let Some(stale) = previous {
                    stale.close().await;
                }
                return Ok(fresh);
            }

            if let Some(winner) = open(&previous) {
                tracing::debug!("Closing raced connection to {}", self.target());
                fresh.close().await;
                return Ok(winner);
            }

            // The winner is already gone; try to install ours in its place
            expected = previous;
        }
    }

    /// Close and forget the current connection
    pub async fn shutdown(&self) {
        if let Some(connection) = self.current.swap(None) {
            connection.close().await;
        }
    }

    /// Clear the slot when the connection closes, unless it was replaced already
    fn watch_close(&self, connection: Arc<C::Connection>) {
        let current = Arc::clone(&self.current);
        let target = self.target().to_string();
        tokio::spawn(async move {
            connection.closed().await;
            tracing::debug!("Connection to {} closed", target);
            let expected = Some(connection);
            let _ = current.compare_and_swap(&expected, None);
        });
    }
}

fn open<T: Connection>(connection: &Option<Arc<T>>) -> Option<Arc<T>> {
    connection.as_ref().filter(|c| !c.is_closed()).cloned()
}

fn same<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
