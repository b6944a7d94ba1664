//! Event loop host.
//!
//! Each engine owns one [`NatsEventLoop`]: a dedicated OS thread running a
//! current-thread tokio runtime. Every broker-facing future (connection
//! handshakes, the client's own upkeep, and the per-subject subscription
//! drain tasks) is spawned onto this runtime, so broker callbacks execute
//! on the loop thread and do nothing but enqueue.

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::connection::{NatsConfiguration, NatsConnection};
use crate::error::NatsError;

/// Owner of the broker I/O thread.
pub struct NatsEventLoop {
    handle: Handle,
    cancel: CancellationToken,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl NatsEventLoop {
    /// Spawns the loop thread and starts its runtime.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::Logical`] if the thread or its runtime cannot
    /// be created.
    pub fn spawn(name: &str) -> Result<Self, NatsError> {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("nats-loop-{name}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(loop_cancel.cancelled());
            })
            .map_err(|e| NatsError::Logical(format!("cannot spawn event loop thread: {e}")))?;

        match handle_rx.recv() {
            Ok(Ok(handle)) => Ok(Self {
                handle,
                cancel,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(e)) => Err(NatsError::Logical(format!(
                "cannot build event loop runtime: {e}"
            ))),
            Err(_) => Err(NatsError::Logical(
                "event loop thread exited during startup".into(),
            )),
        }
    }

    /// Handle of the loop runtime, for spawning broker-facing tasks.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs the startup handshake on the loop and returns the connection.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] when the handshake exhausts
    /// its attempts or the loop has stopped.
    pub async fn create_connection(
        &self,
        config: &NatsConfiguration,
    ) -> Result<NatsConnection, NatsError> {
        let config = config.clone();
        let join = self
            .handle
            .spawn(async move { NatsConnection::connect(&config).await });
        match join.await {
            Ok(result) => result,
            Err(e) => Err(NatsError::ConnectionFailed(format!(
                "event loop stopped during connect: {e}"
            ))),
        }
    }

    /// Signals the loop to exit. In-flight callbacks complete; tasks still
    /// pending when the runtime drops are abandoned.
    pub fn stop_loop(&self) {
        self.cancel.cancel();
    }

    /// Joins the loop thread. Safe to call more than once.
    pub fn join(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            trace!("waiting for event loop thread");
            if thread.join().is_err() {
                warn!("event loop thread panicked");
            }
        }
    }
}

impl Drop for NatsEventLoop {
    fn drop(&mut self) {
        self.stop_loop();
        self.join();
    }
}

impl std::fmt::Debug for NatsEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsEventLoop")
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let event_loop = NatsEventLoop::spawn("test").unwrap();
        // the loop runtime accepts and drives spawned work
        let join = event_loop.handle().spawn(async { 2 + 2 });
        assert_eq!(join.await.unwrap(), 4);

        event_loop.stop_loop();
        event_loop.join();
        event_loop.join(); // idempotent
    }

    #[tokio::test]
    async fn test_create_connection_unreachable() {
        let event_loop = NatsEventLoop::spawn("test").unwrap();
        let config = NatsConfiguration {
            url: Some("nats://127.0.0.1:1".into()),
            servers: vec![],
            username: None,
            password: None,
            token: None,
            credential_file: None,
            max_connect_tries: 2,
            reconnect_wait: Duration::from_millis(5),
            secure: false,
        };
        let err = event_loop.create_connection(&config).await.unwrap_err();
        assert!(matches!(err, NatsError::ConnectionFailed(_)));
        assert!(err.to_string().contains("2 attempts"));
    }
}
