//! Engine settings parsed from table DDL options.
//!
//! Settings arrive as a string key/value map (the `WITH (...)` clause of
//! the table definition). All keys are `nats_`-prefixed; unknown prefixed
//! keys are rejected so a typo fails table creation instead of silently
//! defaulting.

use std::collections::HashMap;
use std::time::Duration;

use rill_core::catalog::TableId;
use rill_core::formats::Format;
use rill_core::session::SessionSettings;

use crate::error::NatsError;
use crate::subject::parse_list;

/// How the engine treats messages the format cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleErrorMode {
    /// Tolerate up to `nats_skip_broken_messages` failures, then fail the
    /// streaming pass.
    #[default]
    Default,
    /// Surface failures as rows carrying `_raw_message` and `_error`.
    Stream,
}

impl std::str::FromStr for HandleErrorMode {
    type Err = NatsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(HandleErrorMode::Default),
            "stream" => Ok(HandleErrorMode::Stream),
            "dead_letter_queue" => Err(NatsError::Configuration(
                "DEAD_LETTER_QUEUE is not supported by the table engine".into(),
            )),
            other => Err(NatsError::Configuration(format!(
                "unknown nats_handle_error_mode '{other}'"
            ))),
        }
    }
}

/// Server-wide credential defaults a table's settings fall back to.
#[derive(Debug, Clone, Default)]
pub struct NatsDefaults {
    /// Fallback username.
    pub username: Option<String>,
    /// Fallback password.
    pub password: Option<String>,
    /// Fallback token.
    pub token: Option<String>,
    /// Fallback credentials file path.
    pub credential_file: Option<String>,
}

/// Validated engine settings, immutable for the table's lifetime.
#[derive(Debug, Clone)]
pub struct NatsSettings {
    /// Single broker URL.
    pub url: Option<String>,
    /// Additional broker endpoints.
    pub server_list: Vec<String>,
    /// Subscription set; at least one subject.
    pub subjects: Vec<String>,
    /// Row format.
    pub format: Format,
    /// Optional format schema payload.
    pub schema: Option<String>,
    /// Number of consumers, `N >= 1`.
    pub num_consumers: usize,
    /// Explicit per-source block size cap.
    pub max_block_size: Option<usize>,
    /// Publish batching cap.
    pub max_rows_per_message: usize,
    /// Broker-side queue group; defaults to the table's full name.
    pub queue_group: Option<String>,
    /// Delay between reconnect attempts.
    pub reconnect_wait: Duration,
    /// Startup handshake retry count.
    pub startup_connect_tries: usize,
    /// Per-pass flush budget; falls back to `stream_flush_interval_ms`.
    pub flush_interval: Option<Duration>,
    /// Broken-message policy.
    pub handle_error_mode: HandleErrorMode,
    /// Parser tolerance under [`HandleErrorMode::Default`].
    pub skip_broken_messages: u64,
    /// Use TLS.
    pub secure: bool,
    /// Username credential.
    pub username: Option<String>,
    /// Password credential.
    pub password: Option<String>,
    /// Token credential.
    pub token: Option<String>,
    /// Credentials file path.
    pub credential_file: Option<String>,
}

const KNOWN_KEYS: &[&str] = &[
    "nats_url",
    "nats_server_list",
    "nats_subjects",
    "nats_format",
    "nats_schema",
    "nats_num_consumers",
    "nats_max_block_size",
    "nats_max_rows_per_message",
    "nats_queue_group",
    "nats_reconnect_wait",
    "nats_startup_connect_tries",
    "nats_flush_interval_ms",
    "nats_handle_error_mode",
    "nats_skip_broken_messages",
    "nats_secure",
    "nats_username",
    "nats_password",
    "nats_token",
    "nats_credential_file",
];

impl NatsSettings {
    /// Parses and validates settings from a DDL options map.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::Configuration`] for unknown `nats_` keys,
    /// missing mandatory settings, unparseable values, or a rejected
    /// error-handling mode.
    pub fn from_options(
        options: &HashMap<String, String>,
        defaults: &NatsDefaults,
    ) -> Result<Self, NatsError> {
        for key in options.keys() {
            if key.starts_with("nats_") && !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(NatsError::Configuration(format!("unknown setting '{key}'")));
            }
        }

        let get = |key: &str| options.get(key).map(String::as_str);
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty()).map(ToOwned::to_owned);

        let url = non_empty("nats_url");
        let server_list = get("nats_server_list")
            .map(|list| parse_list(list, ','))
            .unwrap_or_default();
        if url.is_none() && server_list.is_empty() {
            return Err(NatsError::Configuration(
                "either `nats_url` or `nats_server_list` must be specified".into(),
            ));
        }

        let subjects = get("nats_subjects")
            .map(|list| parse_list(list, ','))
            .unwrap_or_default();
        if subjects.is_empty() {
            return Err(NatsError::Configuration(
                "`nats_subjects` must be specified".into(),
            ));
        }

        let format = get("nats_format")
            .ok_or_else(|| NatsError::Configuration("`nats_format` must be specified".into()))
            .and_then(|name| {
                Format::parse(name)
                    .map_err(|e| NatsError::Configuration(format!("invalid `nats_format`: {e}")))
            })?;

        let num_consumers = parse_key(options, "nats_num_consumers")?.unwrap_or(1);
        if num_consumers == 0 {
            return Err(NatsError::Configuration(
                "`nats_num_consumers` must be at least 1".into(),
            ));
        }
        let max_rows_per_message = parse_key(options, "nats_max_rows_per_message")?.unwrap_or(1);
        if max_rows_per_message == 0 {
            return Err(NatsError::Configuration(
                "`nats_max_rows_per_message` must be at least 1".into(),
            ));
        }

        let handle_error_mode = match get("nats_handle_error_mode") {
            Some(mode) => mode.parse()?,
            None => HandleErrorMode::default(),
        };

        Ok(Self {
            url,
            server_list,
            subjects,
            format,
            schema: non_empty("nats_schema"),
            num_consumers,
            max_block_size: parse_key(options, "nats_max_block_size")?,
            max_rows_per_message,
            queue_group: non_empty("nats_queue_group"),
            reconnect_wait: Duration::from_millis(
                parse_key(options, "nats_reconnect_wait")?.unwrap_or(5000),
            ),
            startup_connect_tries: parse_key(options, "nats_startup_connect_tries")?.unwrap_or(5),
            flush_interval: parse_key(options, "nats_flush_interval_ms")?
                .map(Duration::from_millis),
            handle_error_mode,
            skip_broken_messages: parse_key(options, "nats_skip_broken_messages")?.unwrap_or(0),
            secure: parse_bool(options, "nats_secure")?.unwrap_or(false),
            username: non_empty("nats_username").or_else(|| defaults.username.clone()),
            password: non_empty("nats_password").or_else(|| defaults.password.clone()),
            token: non_empty("nats_token").or_else(|| defaults.token.clone()),
            credential_file: non_empty("nats_credential_file")
                .or_else(|| defaults.credential_file.clone()),
        })
    }

    /// Per-source block size: the explicit setting, or the session's
    /// insert block size split across consumers.
    #[must_use]
    pub fn max_block_size_for(&self, session: &SessionSettings) -> usize {
        self.max_block_size
            .unwrap_or_else(|| (session.max_insert_block_size / self.num_consumers).max(1))
    }

    /// Per-pass flush budget: the explicit setting, or the session's
    /// stream flush interval.
    #[must_use]
    pub fn flush_interval_for(&self, session: &SessionSettings) -> Duration {
        self.flush_interval
            .unwrap_or(Duration::from_millis(session.stream_flush_interval_ms))
    }

    /// Queue group: the explicit setting, or the table's full name.
    #[must_use]
    pub fn queue_group_for(&self, table: &TableId) -> String {
        self.queue_group
            .clone()
            .unwrap_or_else(|| table.full_name())
    }
}

fn parse_key<T: std::str::FromStr>(
    options: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, NatsError>
where
    T::Err: std::fmt::Display,
{
    match options.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            NatsError::Configuration(format!("invalid value '{raw}' for '{key}': {e}"))
        }),
    }
}

fn parse_bool(
    options: &HashMap<String, String>,
    key: &str,
) -> Result<Option<bool>, NatsError> {
    match options.get(key).map(String::as_str) {
        None => Ok(None),
        Some("true" | "1") => Ok(Some(true)),
        Some("false" | "0") => Ok(Some(false)),
        Some(other) => Err(NatsError::Configuration(format!(
            "invalid value '{other}' for '{key}': expected a boolean"
        ))),
    }
}
