//! Background schedule pool.
//!
//! A [`SchedulePool`] hands out named [`TaskHandle`]s whose callbacks run
//! on the pool's runtime. Tasks are one-shot and re-armed explicitly: a
//! callback that wants to run again calls `schedule` / `schedule_after` on
//! its own handle. At most one run of a given task is in flight at any
//! instant, and `deactivate` waits for an in-flight run to finish, so a
//! caller that deactivated a task knows its callback is quiescent.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Boxed future returned by task callbacks.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Task callback: invoked once per scheduled run.
pub type TaskCallback = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// A pool of background tasks bound to a tokio runtime.
#[derive(Clone)]
pub struct SchedulePool {
    handle: Handle,
}

impl SchedulePool {
    /// Creates a pool running tasks on the given runtime handle.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a pool bound to the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Creates a deactivated task; `activate_and_schedule` arms it.
    pub fn create_task(&self, name: impl Into<String>, callback: TaskCallback) -> TaskHandle {
        let inner = Arc::new(TaskInner {
            name: name.into(),
            callback,
            active: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pending: Mutex::new(None),
            wake: Notify::new(),
            exec_lock: tokio::sync::Mutex::new(()),
        });
        let worker = self.handle.spawn(TaskInner::run(Arc::clone(&inner)));
        TaskHandle {
            inner,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }
}

impl std::fmt::Debug for SchedulePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulePool").finish_non_exhaustive()
    }
}

struct TaskInner {
    name: String,
    callback: TaskCallback,
    active: AtomicBool,
    stopped: AtomicBool,
    pending: Mutex<Option<Instant>>,
    wake: Notify,
    /// Held while the callback runs; `deactivate` acquires it to wait for
    /// an in-flight run.
    exec_lock: tokio::sync::Mutex<()>,
}

impl TaskInner {
    async fn run(inner: Arc<TaskInner>) {
        'idle: loop {
            inner.wake.notified().await;
            if inner.stopped.load(Ordering::Acquire) {
                break;
            }
            loop {
                let Some(mut due) = inner.pending.lock().take() else {
                    continue 'idle;
                };
                // Wait for the deadline; a newer schedule or a stop
                // preempts the wait.
                loop {
                    tokio::select! {
                        () = tokio::time::sleep_until(due) => break,
                        () = inner.wake.notified() => {
                            if inner.stopped.load(Ordering::Acquire) {
                                return;
                            }
                            if let Some(newer) = inner.pending.lock().take() {
                                due = newer;
                            }
                        }
                    }
                }
                if inner.stopped.load(Ordering::Acquire) {
                    return;
                }
                if !inner.active.load(Ordering::Acquire) {
                    continue;
                }
                let _guard = inner.exec_lock.lock().await;
                if !inner.active.load(Ordering::Acquire) {
                    continue;
                }
                trace!(task = %inner.name, "running background task");
                (inner.callback)().await;
            }
        }
    }
}

/// Handle to a pooled background task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl TaskHandle {
    /// Returns the task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Marks the task runnable without scheduling it.
    pub fn activate(&self) {
        self.inner.active.store(true, Ordering::Release);
    }

    /// Marks the task runnable and schedules an immediate run.
    pub fn activate_and_schedule(&self) {
        self.activate();
        self.schedule();
    }

    /// Schedules a run as soon as possible. Ignored while deactivated.
    pub fn schedule(&self) {
        self.schedule_after(Duration::ZERO);
    }

    /// Schedules a run after `delay`, replacing any pending schedule.
    /// Ignored while deactivated.
    pub fn schedule_after(&self, delay: Duration) {
        if !self.inner.active.load(Ordering::Acquire) {
            return;
        }
        *self.inner.pending.lock() = Some(Instant::now() + delay);
        self.inner.wake.notify_one();
    }

    /// Deactivates the task and waits for an in-flight run to finish.
    /// Pending schedules are discarded.
    pub async fn deactivate(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.pending.lock().take();
        let _guard = self.inner.exec_lock.lock().await;
    }

    /// Deactivates the task and terminates its worker.
    pub async fn stop(&self) {
        self.deactivate().await;
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.wake.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.inner.name)
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(pool: &SchedulePool, counter: Arc<AtomicUsize>) -> TaskHandle {
        pool.create_task(
            "count",
            Arc::new(move || {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
    }

    async fn wait_for(counter: &AtomicUsize, target: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("counter never reached {target}");
    }

    #[tokio::test]
    async fn test_schedule_runs_once() {
        let pool = SchedulePool::current();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, Arc::clone(&counter));

        task.activate_and_schedule();
        wait_for(&counter, 1).await;

        // One-shot: no further runs without another schedule.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_schedule_while_deactivated_is_ignored() {
        let pool = SchedulePool::current();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, Arc::clone(&counter));

        task.schedule();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_schedule_after_delays() {
        let pool = SchedulePool::current();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, Arc::clone(&counter));

        task.activate();
        task.schedule_after(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        wait_for(&counter, 1).await;

        task.stop().await;
    }

    #[tokio::test]
    async fn test_deactivate_discards_pending() {
        let pool = SchedulePool::current();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, Arc::clone(&counter));

        task.activate();
        task.schedule_after(Duration::from_millis(40));
        task.deactivate().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_self_rescheduling_task() {
        let pool = SchedulePool::current();
        let counter = Arc::new(AtomicUsize::new(0));

        // The callback re-arms its own handle, the way streaming drivers do.
        let slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));
        let counter_in = Arc::clone(&counter);
        let slot_in = Arc::clone(&slot);
        let task = pool.create_task(
            "loop",
            Arc::new(move || {
                let counter = Arc::clone(&counter_in);
                let slot = Arc::clone(&slot_in);
                Box::pin(async move {
                    let runs = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if runs < 3 {
                        if let Some(handle) = slot.lock().as_ref() {
                            handle.schedule();
                        }
                    }
                })
            }),
        );
        *slot.lock() = Some(task.clone());

        task.activate_and_schedule();
        wait_for(&counter, 3).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_stop_terminates_worker() {
        let pool = SchedulePool::current();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(&pool, Arc::clone(&counter));
        task.activate();
        task.schedule_after(Duration::from_secs(60));
        // stop() must not wait for the distant deadline
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .expect("stop should preempt a pending schedule");
    }
}
