//! # `rill-nats`
//!
//! A NATS streaming table engine. A table backed by this engine exposes a
//! set of NATS subjects as a stream: messages arriving on the subjects are
//! decoded by a row format and pushed into the insert pipelines of every
//! materialized view depending on the table; inserts into the table are
//! published back to the broker.
//!
//! ## Architecture
//!
//! ```text
//! broker ── event-loop thread ── per-consumer bounded queue
//!                                        │
//!                       streaming driver (background task)
//!                                        │
//!                          format decode + virtual columns
//!                                        │
//!                          dependent materialized views
//! ```
//!
//! The engine owns a dedicated event-loop thread for broker I/O, a pool of
//! `nats_num_consumers` consumers subscribed under one queue group, and two
//! background tasks: an initializer that brings connection and consumers
//! up, and a streaming driver that drains consumer queues into views while
//! views are attached. Direct `SELECT` and streaming are mutually
//! exclusive; writes open short-lived dedicated connections.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Engine error types.
pub mod error;

/// Engine settings parsed from table DDL options.
pub mod settings;

/// NATS subject wildcard matching.
pub mod subject;

/// Connection configuration and the consumer connection wrapper.
pub mod connection;

/// Event loop host owning the broker I/O thread.
pub mod handler;

/// Subscription consumer with a bounded message queue.
pub mod consumer;

/// Semaphore-gated consumer free list.
pub mod pool;

/// Consumer-backed block source.
pub mod source;

/// Publisher and the insert message sink.
pub mod producer;

/// The table engine façade and its background driver.
pub mod engine;

pub use engine::{AttachMode, NatsTableEngine, VIRTUAL_ERROR, VIRTUAL_RAW_MESSAGE, VIRTUAL_SUBJECT};
pub use error::NatsError;
pub use settings::{HandleErrorMode, NatsDefaults, NatsSettings};
