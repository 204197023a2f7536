//! Acknowledgement plumbing.
//!
//! Every message shares one [`AckState`] with the messages derived from it.
//! The first `ack` or `nack` wins; later calls return `false` and do nothing.

use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::ingest::guard::AdmissionPermit;

/// Cause attached to a negative acknowledgement
pub type NackReason = Arc<dyn Error + Send + Sync + 'static>;

/// Terminal state of a message
#[derive(Debug, Clone)]
pub enum Outcome {
    Acked,
    Nacked(NackReason),
    /// Every copy of the message was dropped without ack or nack
    Dropped,
}

impl Outcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Outcome::Acked)
    }
}

/// Receives the terminal signal of a message
#[async_trait]
pub trait AckHandler: Send + 'static {
    async fn on_ack(self: Box<Self>);

    async fn on_nack(self: Box<Self>, reason: NackReason);
}

/// Handler forwarding the outcome to a [`Completion`]
struct ChannelAck {
    tx: oneshot::Sender<Outcome>,
}

#[async_trait]
impl AckHandler for ChannelAck {
    async fn on_ack(self: Box<Self>) {
        let _ = self.tx.send(Outcome::Acked);
    }

    async fn on_nack(self: Box<Self>, reason: NackReason) {
        let _ = self.tx.send(Outcome::Nacked(reason));
    }
}

/// Awaitable outcome of a tracked message
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Outcome>,
}

impl Completion {
    pub(crate) fn channel() -> (Box<dyn AckHandler>, Completion) {
        let (tx, rx) = oneshot::channel();
        (Box::new(ChannelAck { tx }), Completion { rx })
    }

    /// Wait for the message to be acknowledged, nacked or dropped
    pub async fn wait(self) -> Outcome {
        self.rx.await.unwrap_or(Outcome::Dropped)
    }
}

pub(crate) struct AckState {
    completed: AtomicBool,
    handler: Mutex<Option<Box<dyn AckHandler>>>,
    /// Held until every receiver has taken its copy, or until the state is dropped
    permit: Mutex<Option<AdmissionPermit>>,
    receivers: AtomicUsize,
}

impl AckState {
    pub(crate) fn new(handler: Option<Box<dyn AckHandler>>, permit: Option<AdmissionPermit>) -> Self {
        Self {
            completed: AtomicBool::new(false),
            handler: Mutex::new(handler),
            permit: Mutex::new(permit),
            receivers: AtomicUsize::new(1),
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Number of copies that must be taken before the admission slot is freed
    pub(crate) fn expect_receivers(&self, count: usize) {
        self.receivers.store(count, Ordering::Release);
    }

    /// One receiver took its copy; the last one frees the admission slot
    pub(crate) fn release_admission(&self) {
        let previous = self
            .receivers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            let permit = self.permit.lock().unwrap_or_else(|e| e.into_inner()).take();
            drop(permit);
        }
    }

    /// Run the terminal signal once. Returns `false` if already completed.
    pub(crate) async fn complete(&self, result: Result<(), NackReason>) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let handler = self.handler.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handler) = handler {
            match result {
                Ok(()) => handler.on_ack().await,
                Err(reason) => handler.on_nack(reason).await,
            }
        }
        true
    }
}
