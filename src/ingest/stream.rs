//! Internal stream of an ingestion endpoint.
//!
//! Each subscriber owns an unbounded channel; the admission guard is what
//! bounds the number of messages held across all of them. Taking a message
//! out of a channel frees its admission slot.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use futures::Stream;
use tokio::sync::mpsc;

use crate::message::Message;

type Subscribers = Vec<mpsc::UnboundedSender<Message>>;

/// Fans messages out to the subscribers of one endpoint.
///
/// In broadcast mode every subscriber receives every message, and all copies
/// share the same acknowledgement; the admission slot is freed once every
/// subscriber has taken its copy. Otherwise messages are load-shared round-robin.
pub struct Processor {
    broadcast: bool,
    subscribers: ArcSwap<Subscribers>,
    next: AtomicUsize,
}

impl Processor {
    pub fn new(broadcast: bool) -> Self {
        Self {
            broadcast,
            subscribers: ArcSwap::from_pointee(Vec::new()),
            next: AtomicUsize::new(0),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Register a new consumer
    pub fn subscribe(&self) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.rcu(|current| {
            let mut next: Subscribers = current.iter().filter(|s| !s.is_closed()).cloned().collect();
            next.push(tx.clone());
            next
        });
        MessageStream { rx }
    }

    /// Drop every subscriber; their streams end once drained
    pub fn close(&self) {
        self.subscribers.store(Default::default());
    }

    /// Number of consumers still holding their stream
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().iter().filter(|s| !s.is_closed()).count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Hand a message to the subscribers.
    ///
    /// Returns the message back when no live subscriber accepted it.
    pub fn emit(&self, message: Message) -> Result<(), Message> {
        let subscribers = self.subscribers.load_full();

        if self.broadcast {
            // The slot stays taken until the slowest subscriber has its copy
            message.expect_receivers(subscribers.len());
            let mut delivered = false;
            for subscriber in subscribers.iter() {
                if subscriber.send(message.clone()).is_ok() {
                    delivered = true;
                } else {
                    message.release_admission();
                }
            }
            return if delivered { Ok(()) } else { Err(message) };
        }

        let count = subscribers.len();
        if count == 0 {
            return Err(message);
        }

        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut message = message;
        for offset in 0..count {
            match subscribers[(start + offset) % count].send(message) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }
        Err(message)
    }
}

/// Consumer side of an ingestion endpoint
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MessageStream {
    /// Receive the next message, freeing its admission slot
    pub async fn recv(&mut self) -> Option<Message> {
        let message = self.rx.recv().await?;
        message.release_admission();
        Some(message)
    }

    /// Stop receiving; queued messages stay available to `recv`
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Stream for MessageStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx).map(|message| {
            if let Some(message) = &message {
                message.release_admission();
            }
            message
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::AdmissionGuard;
    use crate::message::{Metadata, Payload};
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_round_robin_load_sharing() {
        let processor = Processor::new(false);
        let mut first = processor.subscribe();
        let mut second = processor.subscribe();

        for i in 0..4 {
            processor.emit(Message::new(format!("m{}", i))).unwrap();
        }

        let a = [first.recv().await.unwrap(), first.recv().await.unwrap()];
        let b = [second.recv().await.unwrap(), second.recv().await.unwrap()];
        assert_eq!(a.len() + b.len(), 4);
        assert_ne!(a[0].payload(), b[0].payload());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let processor = Processor::new(true);
        let mut first = processor.subscribe();
        let mut second = processor.subscribe();

        let (message, completion) = Message::tracked("hello");
        processor.emit(message).unwrap();

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a.id(), b.id());

        assert!(a.ack().await);
        assert!(!b.ack().await);
        assert!(completion.wait().await.is_acked());
    }

    #[tokio::test]
    async fn test_broadcast_slot_waits_for_slowest_subscriber() {
        let guard = Arc::new(AdmissionGuard::new(1));
        let processor = Processor::new(true);
        let mut fast = processor.subscribe();
        let mut stalled = processor.subscribe();

        let (message, _completion) = Message::admitted(Payload::from("first"), Metadata::new(), guard.try_admit().unwrap());
        processor.emit(message).unwrap();

        let taken = fast.recv().await.unwrap();
        taken.ack().await;
        drop(taken);
        assert_eq!(guard.in_use(), 1);
        assert!(guard.try_admit().is_none());

        stalled.recv().await.unwrap();
        assert_eq!(guard.in_use(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_to_closed_subscriber_does_not_hold_slot() {
        let guard = Arc::new(AdmissionGuard::new(1));
        let processor = Processor::new(true);
        let mut live = processor.subscribe();
        drop(processor.subscribe());

        let (message, _completion) = Message::admitted(Payload::from("x"), Metadata::new(), guard.try_admit().unwrap());
        processor.emit(message).unwrap();

        live.recv().await.unwrap();
        assert_eq!(guard.in_use(), 0);
    }

    #[tokio::test]
    async fn test_emit_without_subscriber_returns_message() {
        let processor = Processor::new(false);
        assert!(!processor.has_subscribers());
        assert!(processor.emit(Message::new("lost")).is_err());

        let stream = processor.subscribe();
        assert_eq!(processor.subscriber_count(), 1);
        drop(stream);
        assert!(!processor.has_subscribers());
        assert!(processor.emit(Message::new("lost")).is_err());
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_skipped() {
        let processor = Processor::new(false);
        let closed = processor.subscribe();
        let mut live = processor.subscribe();
        drop(closed);

        for _ in 0..3 {
            processor.emit(Message::new("x")).unwrap();
        }
        for _ in 0..3 {
            assert!(live.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let processor = Processor::new(false);
        let mut stream = processor.subscribe();
        processor.emit(Message::new("queued")).unwrap();

        processor.close();

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
        assert!(processor.emit(Message::new("late")).is_err());
    }

    #[tokio::test]
    async fn test_stream_interface() {
        let processor = Processor::new(false);
        let stream = processor.subscribe();
        processor.emit(Message::new("one")).unwrap();
        processor.emit(Message::new("two")).unwrap();
        drop(processor);

        let payloads: Vec<_> = stream
            .map(|m| m.payload().as_text().unwrap_or_default().to_string())
            .collect()
            .await;
        assert_eq!(payloads, vec!["one", "two"]);
    }
}
