//! Subscription consumer with a bounded message queue.
//!
//! A consumer owns one bounded multi-producer/single-consumer queue. While
//! subscribed, a drain task per subject runs on the engine's event loop and
//! moves broker deliveries into the queue; a full queue parks the drain
//! task, which is the engine's backpressure boundary toward the broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::NatsConnection;
use crate::error::NatsError;

/// One received broker message.
#[derive(Debug, Clone)]
pub(crate) struct EngineMessage {
    /// Concrete subject the message arrived on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
}

/// Queue receiver leased to a source for the duration of a pipeline.
pub(crate) type QueueLease = OwnedMutexGuard<mpsc::Receiver<EngineMessage>>;

/// A subscription holder owning a bounded queue.
///
/// Invariant: the consumer is either unsubscribed or subscribed to every
/// subject in its list; a failure partway through `subscribe` tears the
/// started subscriptions down before returning.
pub struct NatsConsumer {
    subjects: Vec<String>,
    queue_group: String,
    queue_tx: mpsc::Sender<EngineMessage>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EngineMessage>>>,
    queue_len: Arc<AtomicUsize>,
    loop_handle: Handle,
    cancel: Mutex<Option<CancellationToken>>,
    drain_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    subscribed: AtomicBool,
}

impl NatsConsumer {
    /// Creates an unsubscribed consumer with a queue of `queue_size`.
    #[must_use]
    pub fn new(
        subjects: Vec<String>,
        queue_group: String,
        queue_size: usize,
        loop_handle: Handle,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_size.max(1));
        Self {
            subjects,
            queue_group,
            queue_tx,
            queue_rx: Arc::new(tokio::sync::Mutex::new(queue_rx)),
            queue_len: Arc::new(AtomicUsize::new(0)),
            loop_handle,
            cancel: Mutex::new(None),
            drain_tasks: Mutex::new(Vec::new()),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Returns `true` while subscribed to every subject.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Current number of queued messages.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    /// Returns `true` when the queue holds no messages.
    #[must_use]
    pub fn queue_empty(&self) -> bool {
        self.queue_len() == 0
    }

    /// Shared queue-length counter, for probing after a lease moved.
    pub(crate) fn queue_len_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.queue_len)
    }

    /// Takes the exclusive lease on the queue receiver.
    pub(crate) async fn lock_queue(&self) -> QueueLease {
        Arc::clone(&self.queue_rx).lock_owned().await
    }

    /// Producer endpoint of the queue. Tests inject messages through it
    /// the same way drain tasks do.
    pub(crate) fn queue_sender(&self) -> QueueSender {
        QueueSender {
            tx: self.queue_tx.clone(),
            len: Arc::clone(&self.queue_len),
        }
    }

    /// Subscribes to every subject under the shared queue group.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] if any subject fails to
    /// subscribe; subscriptions already started are torn down first.
    pub async fn subscribe(&self, connection: &NatsConnection) -> Result<(), NatsError> {
        if self.subscribed.load(Ordering::Acquire) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let mut started = Vec::with_capacity(self.subjects.len());
        let mut failure = None;
        for subject in &self.subjects {
            match connection
                .client()
                .queue_subscribe(subject.clone(), self.queue_group.clone())
                .await
            {
                Ok(subscriber) => {
                    let sender = self.queue_sender();
                    started.push(self.loop_handle.spawn(drain_subscription(
                        subscriber,
                        subject.clone(),
                        sender,
                        cancel.clone(),
                    )));
                }
                Err(e) => {
                    failure = Some(NatsError::ConnectionFailed(format!(
                        "failed to subscribe to '{subject}': {e}"
                    )));
                    break;
                }
            }
        }

        if let Some(error) = failure {
            // no half-subscribed consumers
            cancel.cancel();
            for task in started {
                let _ = task.await;
            }
            return Err(error);
        }

        *self.cancel.lock() = Some(cancel);
        *self.drain_tasks.lock() = started;
        self.subscribed.store(true, Ordering::Release);
        debug!(subjects = ?self.subjects, group = %self.queue_group, "consumer subscribed");
        Ok(())
    }

    /// Unsubscribes from every subject and waits for the drain tasks.
    /// A no-op when not subscribed.
    pub async fn unsubscribe(&self) {
        if !self.subscribed.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let tasks = std::mem::take(&mut *self.drain_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        debug!(group = %self.queue_group, "consumer unsubscribed");
    }
}

impl std::fmt::Debug for NatsConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsConsumer")
            .field("subjects", &self.subjects)
            .field("queue_group", &self.queue_group)
            .field("subscribed", &self.is_subscribed())
            .field("queued", &self.queue_len())
            .finish()
    }
}

/// Queue producer handle used by drain tasks.
#[derive(Clone)]
pub(crate) struct QueueSender {
    tx: mpsc::Sender<EngineMessage>,
    len: Arc<AtomicUsize>,
}

impl QueueSender {
    /// Enqueues a message, waiting while the queue is full.
    ///
    /// Returns `false` if the queue side has been dropped.
    pub(crate) async fn push(&self, message: EngineMessage) -> bool {
        if self.tx.send(message).await.is_err() {
            return false;
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Marks one message as taken off the queue.
pub(crate) fn note_popped(len: &AtomicUsize) {
    len.fetch_sub(1, Ordering::Relaxed);
}

async fn drain_subscription(
    mut subscriber: async_nats::Subscriber,
    subject: String,
    sender: QueueSender,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = subscriber.next() => {
                let Some(message) = message else {
                    debug!(%subject, "subscription stream ended");
                    break;
                };
                let item = EngineMessage {
                    subject: message.subject.to_string(),
                    payload: message.payload,
                };
                tokio::select! {
                    () = cancel.cancelled() => break,
                    pushed = sender.push(item) => {
                        if !pushed {
                            break;
                        }
                    }
                }
            }
        }
    }
    if let Err(e) = subscriber.unsubscribe().await {
        warn!(%subject, error = %e, "failed to unsubscribe");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_consumer(queue_size: usize) -> NatsConsumer {
        NatsConsumer::new(
            vec!["orders".into(), "t.*".into()],
            "group".into(),
            queue_size,
            Handle::current(),
        )
    }

    fn message(subject: &str, payload: &str) -> EngineMessage {
        EngineMessage {
            subject: subject.into(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_queue_push_pop() {
        let consumer = test_consumer(16);
        let sender = consumer.queue_sender();
        assert!(sender.push(message("orders", "a")).await);
        assert!(sender.push(message("orders", "b")).await);
        assert_eq!(consumer.queue_len(), 2);
        assert!(!consumer.queue_empty());

        let len_handle = consumer.queue_len_handle();
        let mut lease = consumer.lock_queue().await;
        let first = lease.recv().await.unwrap();
        note_popped(&len_handle);
        assert_eq!(first.subject, "orders");
        assert_eq!(&first.payload[..], b"a");
        assert_eq!(consumer.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let consumer = test_consumer(1);
        let sender = consumer.queue_sender();
        assert!(sender.push(message("orders", "a")).await);

        // a second push must wait until the queue drains
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sender.push(message("orders", "b")),
        )
        .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscribe() {
        let consumer = test_consumer(4);
        assert!(!consumer.is_subscribed());
        consumer.unsubscribe().await; // no-op
        assert!(!consumer.is_subscribed());
    }
}
