//! Dispatch side of the gateway.
//!
//! A [`Dispatcher`] delivers messages through a [`Transport`] with at most
//! `max_inflight` deliveries running at once. Each delivery is retried
//! according to the sink's [`RetryPolicy`] and ends with exactly one `ack`
//! or `nack` of the message.

pub mod connection;
pub mod http;
pub mod websocket;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::message::Message;
use crate::retry::{RetryPolicy, Retryable};

/// Error type for a single delivery attempt
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] CodecError),

    #[error("Invalid request to {url}: {reason}")]
    InvalidRequest { url: String, reason: String },

    #[error("Http request to {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("Http request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Wait queue for {0} is full")]
    QueueFull(String),

    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Failed to write to {url}: {reason}")]
    Write { url: String, reason: String },

    #[error("Connection to {0} is closed")]
    Closed(String),

    #[error("Delivery to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

impl Retryable for DeliveryError {
    fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Serialize(_) | DeliveryError::InvalidRequest { .. })
    }
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        Retryable::is_retryable(self)
    }
}

/// Error type for handing a message to a dispatcher
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Too many in-flight messages for {target}")]
    Overflow { target: String, message: Message },

    #[error("Dispatcher for {target} is closed")]
    Closed { target: String, message: Message },
}

impl DispatchError {
    /// Take back the message that was not accepted
    pub fn into_message(self) -> Message {
        match self {
            DispatchError::Overflow { message, .. } | DispatchError::Closed { message, .. } => message,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, DispatchError::Overflow { .. })
    }
}

/// Delivers one message to a remote peer
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Remote endpoint, used in logs and errors
    fn target(&self) -> &str;

    /// One delivery attempt
    async fn send(&self, message: &Message) -> Result<(), DeliveryError>;
}

/// Validated settings shared by every sink
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    target: String,
    max_inflight: usize,
    retry: RetryPolicy,
    wait_for_completion: bool,
    timeout: Option<Duration>,
}

impl DispatchOptions {
    /// Create options for `target` allowing `max_inflight` concurrent deliveries
    pub fn new(target: impl Into<String>, max_inflight: i64) -> Result<Self, ConfigError> {
        if max_inflight <= 0 {
            return Err(ConfigError::InvalidInflights(max_inflight));
        }
        let max_inflight = usize::try_from(max_inflight)
            .map_err(|_| ConfigError::InvalidInflights(max_inflight))?
            .min(Semaphore::MAX_PERMITS);

        Ok(Self {
            target: target.into(),
            max_inflight,
            retry: RetryPolicy::none(),
            wait_for_completion: true,
            timeout: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Keep the in-flight slot until ack/nack has completed (default), or free
    /// it as soon as the transport is done
    pub fn wait_for_completion(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }

    /// Bound every delivery attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn waits_for_completion(&self) -> bool {
        self.wait_for_completion
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Bounded delivery pipeline of one sink
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    options: DispatchOptions,
    transport: Arc<dyn Transport>,
    slots: Arc<Semaphore>,
    pending: AtomicUsize,
    idle: Notify,
}

impl Dispatcher {
    pub fn new(options: DispatchOptions, transport: impl Transport) -> Self {
        Self::with_transport(options, Arc::new(transport))
    }

    pub fn with_transport(options: DispatchOptions, transport: Arc<dyn Transport>) -> Self {
        let slots = Arc::new(Semaphore::new(options.max_inflight));
        Self {
            inner: Arc::new(Inner {
                options,
                transport,
                slots,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.inner.options
    }

    pub fn target(&self) -> &str {
        self.inner.transport.target()
    }

    /// Slots taken by running deliveries
    pub fn in_flight(&self) -> usize {
        self.inner.options.max_inflight - self.inner.slots.available_permits()
    }

    /// Deliveries not yet finished with ack/nack
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Hand a message over, waiting for a free in-flight slot.
    ///
    /// The wait is what propagates back-pressure to the producer.
    pub async fn submit(&self, message: Message) -> Result<(), DispatchError> {
        match Arc::clone(&self.inner.slots).acquire_owned().await {
            Ok(permit) => {
                self.spawn_delivery(permit, message);
                Ok(())
            }
            Err(_) => Err(DispatchError::Closed {
                target: self.target().to_string(),
                message,
            }),
        }
    }

    /// Hand a message over only if a slot is free right now
    pub fn try_submit(&self, message: Message) -> Result<(), DispatchError> {
        match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(permit) => {
                self.spawn_delivery(permit, message);
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(DispatchError::Overflow {
                target: self.target().to_string(),
                message,
            }),
            Err(TryAcquireError::Closed) => Err(DispatchError::Closed {
                target: self.target().to_string(),
                message,
            }),
        }
    }

    /// Consume `stream` until it ends, then wait for the remaining deliveries
    pub async fn run<S>(&self, stream: S)
    where
        S: Stream<Item = Message> + Send,
    {
        tracing::info!("Dispatching messages to {}", self.target());
        futures::pin_mut!(stream);
        while let Some(message) = stream.next().await {
            if let Err(e) = self.submit(message).await {
                tracing::warn!("{}", e);
                e.into_message().nack(format!("Dispatcher for {} is closed", self.target())).await;
            }
        }
        self.drain().await;
        tracing::info!("Dispatcher for {} stopped", self.target());
    }

    /// Stop accepting new messages; running deliveries continue
    pub fn close(&self) {
        self.inner.slots.close();
    }

    /// Wait until every accepted delivery has been acked or nacked
    pub async fn drain(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }

    fn spawn_delivery(&self, permit: OwnedSemaphorePermit, message: Message) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.deliver(permit, message).await;
            if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }
}

impl Inner {
    async fn deliver(&self, permit: OwnedSemaphorePermit, message: Message) {
        let target = self.transport.target();
        tracing::debug!("maxRetries: {} for {}", self.options.retry.max_retries(), target);

        let result = self
            .options
            .retry
            .run(|_attempt| self.attempt(&message))
            .await;

        let mut permit = Some(permit);
        if !self.options.wait_for_completion {
            drop(permit.take());
        }

        match result {
            Ok(()) => {
                message.ack().await;
                tracing::trace!("Responded with success to {}", target);
            }
            Err(e) => {
                tracing::warn!("Unable to dispatch message to {}: {}", target, e);
                message.nack(e).await;
            }
        }

        drop(permit);
    }

    async fn attempt(&self, message: &Message) -> Result<(), DeliveryError> {
        match self.options.timeout {
            None => self.transport.send(message).await,
            Some(timeout) => tokio::time::timeout(timeout, self.transport.send(message))
                .await
                .unwrap_or_else(|_| {
                    Err(DeliveryError::Timeout {
                        url: self.transport.target().to_string(),
                        timeout,
                    })
                }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::{AckHandler, NackReason, Outcome};
    use std::sync::atomic::AtomicU32;
    use tokio::sync::watch;

    /// Fails the first `failures` attempts
    pub(crate) struct ScriptedTransport {
        pub failures: u32,
        pub retryable: bool,
        pub attempts: Arc<AtomicU32>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(failures: u32) -> Self {
            Self {
                failures,
                retryable: true,
                attempts: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn target(&self) -> &str {
            "mock://scripted"
        }

        async fn send(&self, _message: &Message) -> Result<(), DeliveryError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                if self.retryable {
                    Err(DeliveryError::Status {
                        url: self.target().to_string(),
                        status: 503,
                    })
                } else {
                    Err(DeliveryError::InvalidRequest {
                        url: self.target().to_string(),
                        reason: "bad".to_string(),
                    })
                }
            } else {
                Ok(())
            }
        }
    }

    /// Blocks every send until the gate opens
    struct GatedTransport {
        gate: watch::Receiver<bool>,
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        fn target(&self) -> &str {
            "mock://gated"
        }

        async fn send(&self, _message: &Message) -> Result<(), DeliveryError> {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Acknowledgement that only finishes once its gate opens
    struct SlowAck {
        gate: watch::Receiver<bool>,
    }

    #[async_trait]
    impl AckHandler for SlowAck {
        async fn on_ack(self: Box<Self>) {
            let mut gate = self.gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }

        async fn on_nack(self: Box<Self>, _reason: NackReason) {}
    }

    fn options(max_inflight: i64, max_retries: u32) -> DispatchOptions {
        DispatchOptions::new("mock://", max_inflight)
            .unwrap()
            .with_retry(RetryPolicy::new(max_retries, None, 0.0).unwrap())
    }

    #[test]
    fn test_non_positive_inflights_rejected() {
        assert!(matches!(
            DispatchOptions::new("http://x", 0),
            Err(ConfigError::InvalidInflights(0))
        ));
        assert!(matches!(
            DispatchOptions::new("http://x", -3),
            Err(ConfigError::InvalidInflights(-3))
        ));
    }

    #[tokio::test]
    async fn test_success_after_retries_acks_once() {
        for k in 0..4 {
            let transport = ScriptedTransport::new(k);
            let attempts = Arc::clone(&transport.attempts);
            let dispatcher = Dispatcher::new(options(1, k), transport);

            let (message, completion) = Message::tracked("payload");
            dispatcher.submit(message).await.unwrap();

            assert!(completion.wait().await.is_acked());
            assert_eq!(attempts.load(Ordering::SeqCst), k + 1);
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_nack_once() {
        for k in 0..4 {
            let transport = ScriptedTransport::new(u32::MAX);
            let attempts = Arc::clone(&transport.attempts);
            let dispatcher = Dispatcher::new(options(1, k), transport);

            let (message, completion) = Message::tracked("payload");
            dispatcher.submit(message.clone()).await.unwrap();

            match completion.wait().await {
                Outcome::Nacked(reason) => assert!(reason.to_string().contains("503")),
                other => panic!("expected nack, got {:?}", other),
            }
            assert_eq!(attempts.load(Ordering::SeqCst), k + 1);
            assert!(!message.ack().await);
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let mut transport = ScriptedTransport::new(1);
        transport.retryable = false;
        let attempts = Arc::clone(&transport.attempts);
        let dispatcher = Dispatcher::new(options(1, 5), transport);

        let (message, completion) = Message::tracked("payload");
        dispatcher.submit(message).await.unwrap();

        assert!(matches!(completion.wait().await, Outcome::Nacked(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inflight_window_overflows_then_drains() {
        let (open, gate) = watch::channel(false);
        let sent = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            options(3, 0),
            GatedTransport {
                gate,
                sent: Arc::clone(&sent),
            },
        );

        let mut completions = Vec::new();
        for _ in 0..3 {
            let (message, completion) = Message::tracked("m");
            dispatcher.try_submit(message).unwrap();
            completions.push(completion);
        }
        assert_eq!(dispatcher.in_flight(), 3);

        let (extra, extra_completion) = Message::tracked("extra");
        let rejected = dispatcher.try_submit(extra).unwrap_err();
        assert!(rejected.is_overflow());

        // The producer waits for a slot instead of failing
        let resubmit = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.submit(rejected.into_message()).await })
        };
        completions.push(extra_completion);

        open.send(true).unwrap();
        resubmit.await.unwrap().unwrap();
        for completion in completions {
            assert!(completion.wait().await.is_acked());
        }
        dispatcher.drain().await;
        assert_eq!(sent.load(Ordering::SeqCst), 4);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiting_for_completion_holds_slot_during_ack() {
        let (release_ack, ack_gate) = watch::channel(false);
        let dispatcher = Dispatcher::new(options(1, 0), ScriptedTransport::new(0));

        let message = Message::with_ack_handler("m", SlowAck { gate: ack_gate });
        dispatcher.submit(message).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(message_rejected(&dispatcher));

        release_ack.send(true).unwrap();
        dispatcher.drain().await;
        assert!(dispatcher.try_submit(Message::new("next")).is_ok());
    }

    #[tokio::test]
    async fn test_fire_and_forget_frees_slot_before_ack() {
        let (release_ack, ack_gate) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            options(1, 0).wait_for_completion(false),
            ScriptedTransport::new(0),
        );

        let message = Message::with_ack_handler("m", SlowAck { gate: ack_gate });
        dispatcher.submit(message).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.pending(), 1);
        assert!(dispatcher.try_submit(Message::new("next")).is_ok());

        release_ack.send(true).unwrap();
        dispatcher.drain().await;
        assert_eq!(dispatcher.pending(), 0);
    }

    fn message_rejected(dispatcher: &Dispatcher) -> bool {
        matches!(
            dispatcher.try_submit(Message::new("probe")),
            Err(DispatchError::Overflow { .. })
        )
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_nacked() {
        let (_open, gate) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            options(1, 1).with_timeout(Duration::from_millis(20)),
            GatedTransport {
                gate,
                sent: Arc::new(AtomicUsize::new(0)),
            },
        );

        let (message, completion) = Message::tracked("m");
        dispatcher.submit(message).await.unwrap();

        match completion.wait().await {
            Outcome::Nacked(reason) => assert!(reason.to_string().contains("timed out")),
            other => panic!("expected timeout nack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_consumes_stream_and_drains() {
        let transport = ScriptedTransport::new(0);
        let attempts = Arc::clone(&transport.attempts);
        let dispatcher = Dispatcher::new(options(2, 0), transport);

        let mut completions = Vec::new();
        let mut messages = Vec::new();
        for i in 0..10 {
            let (message, completion) = Message::tracked(format!("m{}", i));
            messages.push(message);
            completions.push(completion);
        }

        dispatcher.run(futures::stream::iter(messages)).await;

        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        for completion in completions {
            assert!(completion.wait().await.is_acked());
        }
    }

    #[tokio::test]
    async fn test_closed_dispatcher_returns_message() {
        let dispatcher = Dispatcher::new(options(1, 0), ScriptedTransport::new(0));
        dispatcher.close();

        let error = dispatcher.submit(Message::new("late")).await.unwrap_err();
        assert!(matches!(error, DispatchError::Closed { .. }));
        assert_eq!(error.into_message().payload().as_text(), Some("late"));
    }
}
