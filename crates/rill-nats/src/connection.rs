//! Connection configuration and the consumer connection wrapper.

use std::time::Duration;

use async_nats::connection::State;
use async_nats::ConnectOptions;
use tracing::{debug, warn};

use crate::error::NatsError;
use crate::settings::NatsSettings;

/// Broker connection parameters derived from engine settings.
#[derive(Debug, Clone)]
pub struct NatsConfiguration {
    /// Primary broker URL, tried first.
    pub url: Option<String>,
    /// Additional broker endpoints.
    pub servers: Vec<String>,
    /// Username credential.
    pub username: Option<String>,
    /// Password credential.
    pub password: Option<String>,
    /// Token credential.
    pub token: Option<String>,
    /// Credentials file path.
    pub credential_file: Option<String>,
    /// Startup handshake attempts before giving up.
    pub max_connect_tries: usize,
    /// Delay between handshake attempts and client-side reconnects.
    pub reconnect_wait: Duration,
    /// Use TLS.
    pub secure: bool,
}

impl NatsConfiguration {
    /// Builds connection parameters from validated settings.
    #[must_use]
    pub fn from_settings(settings: &NatsSettings) -> Self {
        Self {
            url: settings.url.clone(),
            servers: settings.server_list.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            token: settings.token.clone(),
            credential_file: settings.credential_file.clone(),
            max_connect_tries: settings.startup_connect_tries,
            reconnect_wait: settings.reconnect_wait,
            secure: settings.secure,
        }
    }

    /// Comma-separated endpoint list in connection order.
    #[must_use]
    pub fn server_addrs(&self) -> String {
        let mut endpoints: Vec<&str> = Vec::with_capacity(self.servers.len() + 1);
        if let Some(url) = &self.url {
            endpoints.push(url);
        }
        endpoints.extend(self.servers.iter().map(String::as_str));
        endpoints.join(",")
    }

    async fn connect_options(&self) -> Result<ConnectOptions, NatsError> {
        let reconnect_wait = self.reconnect_wait;
        let mut options = ConnectOptions::new()
            .connection_timeout(Duration::from_secs(5))
            .max_reconnects(None)
            .reconnect_delay_callback(move |_attempts| reconnect_wait);

        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }
        if let Some(token) = &self.token {
            options = options.token(token.clone());
        }
        if let Some(path) = &self.credential_file {
            options = options.credentials_file(path).await.map_err(|e| {
                NatsError::Configuration(format!("cannot load credentials file '{path}': {e}"))
            })?;
        }
        if self.secure {
            options = options.require_tls(true);
        }
        Ok(options)
    }
}

/// A live broker session.
///
/// Client-side reconnects are handled by the broker client transparently;
/// callers observe them only through [`NatsConnection::is_connected`].
#[derive(Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
    info: String,
}

impl NatsConnection {
    /// Performs the startup handshake, retrying up to
    /// `max_connect_tries` times spaced by `reconnect_wait`.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] when every attempt fails,
    /// or [`NatsError::Configuration`] for unusable credentials.
    pub(crate) async fn connect(config: &NatsConfiguration) -> Result<Self, NatsError> {
        let addrs = config.server_addrs();
        if addrs.is_empty() {
            return Err(NatsError::ConnectionFailed(
                "no broker endpoints configured".into(),
            ));
        }

        let tries = config.max_connect_tries.max(1);
        let mut last_error = String::new();
        for attempt in 1..=tries {
            let options = config.connect_options().await?;
            match options.connect(addrs.as_str()).await {
                Ok(client) => {
                    debug!(endpoints = %addrs, attempt, "connected to NATS");
                    return Ok(Self {
                        client,
                        info: addrs,
                    });
                }
                Err(e) => {
                    warn!(endpoints = %addrs, attempt, error = %e, "NATS connect attempt failed");
                    last_error = e.to_string();
                    if attempt < tries {
                        tokio::time::sleep(config.reconnect_wait).await;
                    }
                }
            }
        }
        Err(NatsError::ConnectionFailed(format!(
            "no broker reachable at {addrs} after {tries} attempts: {last_error}"
        )))
    }

    /// Returns `true` while the client session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    /// Flushes buffered published messages to the broker.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] if the flush fails.
    pub async fn flush(&self) -> Result<(), NatsError> {
        self.client
            .flush()
            .await
            .map_err(|e| NatsError::ConnectionFailed(format!("flush failed: {e}")))
    }

    /// Drains and closes the session. Failures are logged, not returned;
    /// disconnect runs on teardown paths that must not abort.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.drain().await {
            warn!(endpoints = %self.info, error = %e, "failed to drain NATS connection");
        }
    }

    /// Endpoint list for log messages.
    #[must_use]
    pub fn info_for_log(&self) -> &str {
        &self.info
    }

    pub(crate) fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

impl std::fmt::Debug for NatsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsConnection")
            .field("endpoints", &self.info)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> NatsConfiguration {
        NatsConfiguration {
            url: Some(url.into()),
            servers: vec![],
            username: None,
            password: None,
            token: None,
            credential_file: None,
            max_connect_tries: 1,
            reconnect_wait: Duration::from_millis(10),
            secure: false,
        }
    }

    #[test]
    fn test_server_addrs_joins_url_and_list() {
        let mut cfg = config("nats://a:4222");
        cfg.servers = vec!["nats://b:4222".into(), "nats://c:4222".into()];
        assert_eq!(cfg.server_addrs(), "nats://a:4222,nats://b:4222,nats://c:4222");
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails() {
        // port 1 is never a NATS broker; the refusal is immediate
        let err = NatsConnection::connect(&config("nats://127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, NatsError::ConnectionFailed(_)));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn test_connect_no_endpoints() {
        let mut cfg = config("nats://127.0.0.1:1");
        cfg.url = None;
        let err = NatsConnection::connect(&cfg).await.unwrap_err();
        assert!(err.to_string().contains("no broker endpoints"));
    }
}
