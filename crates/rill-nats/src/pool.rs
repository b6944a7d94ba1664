//! Semaphore-gated consumer free list.
//!
//! The pool is a LIFO stack of consumers guarded by a counting semaphore.
//! Sources lease a consumer for the duration of a pipeline and release it
//! on drop; subscribe/unsubscribe sweeps operate on a snapshot of the
//! currently pooled consumers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::connection::NatsConnection;
use crate::consumer::NatsConsumer;

/// Fixed-size consumer free list.
pub struct ConsumerPool {
    consumers: Mutex<Vec<Arc<NatsConsumer>>>,
    semaphore: Arc<Semaphore>,
    created: AtomicUsize,
}

impl ConsumerPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            consumers: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(0)),
            created: AtomicUsize::new(0),
        }
    }

    /// Adds a freshly created consumer to the pool.
    pub fn add(&self, consumer: Arc<NatsConsumer>) {
        self.created.fetch_add(1, Ordering::Release);
        self.release(consumer);
    }

    /// Returns a leased consumer to the free list.
    pub fn release(&self, consumer: Arc<NatsConsumer>) {
        self.consumers.lock().push(consumer);
        self.semaphore.add_permits(1);
    }

    /// Leases the most recently released consumer.
    ///
    /// With `timeout == None` the call waits indefinitely; otherwise it
    /// returns `None` once the timeout elapses.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Option<Arc<NatsConsumer>> {
        let permit = match timeout {
            None => Arc::clone(&self.semaphore).acquire_owned().await.ok()?,
            Some(timeout) => tokio::time::timeout(
                timeout,
                Arc::clone(&self.semaphore).acquire_owned(),
            )
            .await
            .ok()?
            .ok()?,
        };
        permit.forget();
        let leased = self.consumers.lock().pop();
        debug_assert!(leased.is_some(), "semaphore permit without a pooled consumer");
        leased
    }

    /// Number of consumers ever added.
    #[must_use]
    pub fn num_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Number of consumers currently in the free list.
    #[must_use]
    pub fn available(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Subscribes every pooled consumer.
    ///
    /// Returns `true` only when every created consumer ended up
    /// subscribed. On a partial result the pool is left as-is; the caller
    /// treats it as not-ready and retries.
    pub async fn subscribe_all(&self, connection: &NatsConnection) -> bool {
        let snapshot: Vec<Arc<NatsConsumer>> = self.consumers.lock().clone();
        let mut subscribed = 0;
        for consumer in &snapshot {
            match consumer.subscribe(connection).await {
                Ok(()) => subscribed += 1,
                Err(e) => {
                    warn!(error = %e, "failed to subscribe consumer");
                    break;
                }
            }
        }
        subscribed == self.num_created()
    }

    /// Unsubscribes every pooled consumer.
    pub async fn unsubscribe_all(&self) {
        let snapshot: Vec<Arc<NatsConsumer>> = self.consumers.lock().clone();
        for consumer in &snapshot {
            consumer.unsubscribe().await;
        }
    }
}

impl Default for ConsumerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("created", &self.num_created())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Handle;

    fn consumer(tag: &str) -> Arc<NatsConsumer> {
        Arc::new(NatsConsumer::new(
            vec![tag.to_string()],
            "group".into(),
            8,
            Handle::current(),
        ))
    }

    #[tokio::test]
    async fn test_acquire_is_lifo() {
        let pool = ConsumerPool::new();
        let first = consumer("a");
        let second = consumer("b");
        pool.add(Arc::clone(&first));
        pool.add(Arc::clone(&second));
        assert_eq!(pool.num_created(), 2);
        assert_eq!(pool.available(), 2);

        let leased = pool.acquire(None).await.unwrap();
        assert!(Arc::ptr_eq(&leased, &second));
        assert_eq!(pool.available(), 1);

        pool.release(leased);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.num_created(), 2); // release does not re-count
    }

    #[tokio::test]
    async fn test_acquire_timeout_on_empty() {
        let pool = ConsumerPool::new();
        let leased = pool.acquire(Some(Duration::from_millis(20))).await;
        assert!(leased.is_none());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(ConsumerPool::new());
        pool.add(consumer("a"));
        let leased = pool.acquire(None).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(Some(Duration::from_secs(1))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(leased);

        let reacquired = waiter.await.unwrap();
        assert!(reacquired.is_some());
    }
}
