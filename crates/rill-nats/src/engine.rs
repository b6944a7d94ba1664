//! The table engine façade and its background driver.
//!
//! [`NatsTableEngine`] ties the pieces together: it owns the event loop,
//! the consumer connection, the consumer pool, and two background tasks.
//! The *initializer* task brings the connection and consumers up and
//! subscribes them once at least one materialized view depends on the
//! table; the *streaming* task drains consumer queues into the dependent
//! views until the last view detaches, then unsubscribes and re-arms the
//! initializer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use tracing::{debug, info, trace, warn};

use rill_core::catalog::{Catalog, TableId};
use rill_core::formats::{create_deserializer, create_serializer, Format};
use rill_core::mv::{MaterializedView, ViewFanoutSink};
use rill_core::pipeline::{BatchSource, ConvertingSource, Pipe};
use rill_core::scheduler::{SchedulePool, TaskHandle};
use rill_core::session::SessionSettings;

use crate::connection::{NatsConfiguration, NatsConnection};
use crate::error::NatsError;
use crate::handler::NatsEventLoop;
use crate::pool::ConsumerPool;
use crate::producer::{MessageSink, NatsProducer};
use crate::settings::{HandleErrorMode, NatsSettings};
use crate::source::{NatsSource, SourceParams};
use crate::subject;
use crate::consumer::NatsConsumer;

/// Virtual column carrying the concrete subject of each row.
pub const VIRTUAL_SUBJECT: &str = "_subject";
/// Virtual column carrying the raw payload of a broken message.
pub const VIRTUAL_RAW_MESSAGE: &str = "_raw_message";
/// Virtual column carrying the decode error of a broken message.
pub const VIRTUAL_ERROR: &str = "_error";

/// Floor for the per-consumer queue capacity.
const QUEUE_SIZE: usize = 100_000;
/// Backoff used whenever a background task re-arms itself after an
/// unproductive pass.
const RESCHEDULE_DELAY: Duration = Duration::from_millis(500);
/// Wall-clock cap on one streaming activation, releasing the scheduler
/// thread to other tables.
const MAX_THREAD_WORK_DURATION: Duration = Duration::from_secs(60);
/// How long the read façade and shutdown wait for a pooled consumer.
const CONSUMER_LEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// How strictly table creation treats a failed startup handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Initial `CREATE`: a failed handshake fails the creation.
    Create,
    /// Re-attach: the table comes up degraded and keeps retrying.
    Attach,
}

/// A table backed by a NATS subject set.
pub struct NatsTableEngine {
    table_id: TableId,
    columns: SchemaRef,
    settings: NatsSettings,
    configuration: NatsConfiguration,
    session: SessionSettings,
    catalog: Arc<Catalog>,
    event_loop: NatsEventLoop,
    pool: Arc<ConsumerPool>,
    connection: parking_lot::Mutex<Option<NatsConnection>>,
    consumers_ready: AtomicBool,
    mv_attached: AtomicBool,
    shutdown_called: Arc<AtomicBool>,
    queue_size: usize,
    init_task: OnceLock<TaskHandle>,
    streaming_task: OnceLock<TaskHandle>,
}

impl NatsTableEngine {
    /// Creates the engine: spawns the event loop, attempts the startup
    /// connection, and wires the background tasks (left deactivated until
    /// [`startup`](Self::startup)).
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] under [`AttachMode::Create`]
    /// when no broker is reachable, or [`NatsError::Logical`] when the
    /// event loop cannot start. Under [`AttachMode::Attach`] a failed
    /// handshake only logs; the initializer keeps retrying.
    pub async fn new(
        table_id: TableId,
        columns: SchemaRef,
        settings: NatsSettings,
        catalog: Arc<Catalog>,
        schedule_pool: &SchedulePool,
        session: SessionSettings,
        mode: AttachMode,
    ) -> Result<Arc<Self>, NatsError> {
        let configuration = NatsConfiguration::from_settings(&settings);
        let event_loop = NatsEventLoop::spawn(&table_id.full_name())?;
        let queue_size = QUEUE_SIZE.max(settings.max_block_size_for(&session));

        let engine = Arc::new(Self {
            table_id,
            columns,
            settings,
            configuration,
            session,
            catalog,
            event_loop,
            pool: Arc::new(ConsumerPool::new()),
            connection: parking_lot::Mutex::new(None),
            consumers_ready: AtomicBool::new(false),
            mv_attached: AtomicBool::new(false),
            shutdown_called: Arc::new(AtomicBool::new(false)),
            queue_size,
            init_task: OnceLock::new(),
            streaming_task: OnceLock::new(),
        });

        if let Err(e) = engine.ensure_connection().await {
            match mode {
                AttachMode::Create => {
                    engine.event_loop.stop_loop();
                    engine.event_loop.join();
                    return Err(e);
                }
                AttachMode::Attach => {
                    warn!(
                        table = %engine.table_id,
                        error = %e,
                        "attaching NATS table without a broker connection"
                    );
                }
            }
        }

        let init_weak = Arc::downgrade(&engine);
        let init_task = schedule_pool.create_task(
            format!("{}.init_consumers", engine.table_id.full_name()),
            Arc::new(move || {
                let weak = init_weak.clone();
                Box::pin(async move {
                    if let Some(engine) = weak.upgrade() {
                        engine.initialize_consumers().await;
                    }
                })
            }),
        );
        let _ = engine.init_task.set(init_task);

        let streaming_weak = Arc::downgrade(&engine);
        let streaming_task = schedule_pool.create_task(
            format!("{}.streaming", engine.table_id.full_name()),
            Arc::new(move || {
                let weak = streaming_weak.clone();
                Box::pin(async move {
                    if let Some(engine) = weak.upgrade() {
                        engine.streaming_func().await;
                    }
                })
            }),
        );
        let _ = engine.streaming_task.set(streaming_task);

        info!(
            table = %engine.table_id,
            subjects = ?engine.settings.subjects,
            format = %engine.settings.format,
            schema = ?engine.settings.schema,
            consumers = engine.settings.num_consumers,
            "NATS table engine created"
        );
        Ok(engine)
    }

    /// The table's identifier.
    #[must_use]
    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    /// The engine's validated settings.
    #[must_use]
    pub fn settings(&self) -> &NatsSettings {
        &self.settings
    }

    /// Returns `true` while at least one materialized view is being fed.
    #[must_use]
    pub fn is_mv_attached(&self) -> bool {
        self.mv_attached.load(Ordering::Acquire)
    }

    /// Returns `true` once every created consumer is subscribed.
    #[must_use]
    pub fn consumers_ready(&self) -> bool {
        self.consumers_ready.load(Ordering::Acquire)
    }

    /// Virtual columns this engine appends to every sourced block.
    #[must_use]
    pub fn virtual_fields(mode: HandleErrorMode) -> Vec<Field> {
        let mut fields = vec![Field::new(VIRTUAL_SUBJECT, DataType::Utf8, false)];
        if mode == HandleErrorMode::Stream {
            fields.push(Field::new(VIRTUAL_RAW_MESSAGE, DataType::Utf8, true));
            fields.push(Field::new(VIRTUAL_ERROR, DataType::Utf8, true));
        }
        fields
    }

    /// Data columns as decoded by the format. Under STREAM error handling
    /// they are relaxed to nullable so a broken message can materialize as
    /// an all-null data row.
    fn data_schema(&self) -> SchemaRef {
        if self.settings.handle_error_mode == HandleErrorMode::Stream {
            let relaxed: Vec<Field> = self
                .columns
                .fields()
                .iter()
                .map(|field| Field::new(field.name().clone(), field.data_type().clone(), true))
                .collect();
            Arc::new(Schema::new(relaxed))
        } else {
            self.columns.clone()
        }
    }

    /// Data columns followed by the virtual columns.
    fn source_header(&self) -> SchemaRef {
        let data = self.data_schema();
        let mut fields: Vec<Field> = data
            .fields()
            .iter()
            .map(|field| field.as_ref().clone())
            .collect();
        fields.extend(Self::virtual_fields(self.settings.handle_error_mode));
        Arc::new(Schema::new(fields))
    }

    /// Resolves requested column names against the source header; an
    /// empty request selects the whole header.
    fn projection_schema(&self, column_names: &[String]) -> Result<SchemaRef, NatsError> {
        let header = self.source_header();
        if column_names.is_empty() {
            return Ok(header);
        }
        let mut fields = Vec::with_capacity(column_names.len());
        for name in column_names {
            let field = header.field_with_name(name).map_err(|_| {
                NatsError::BadArguments(format!("unknown column '{name}'"))
            })?;
            fields.push(field.clone());
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    fn source_params(&self, max_block_size: usize, flush_budget: Duration) -> Result<SourceParams, NatsError> {
        Ok(SourceParams {
            deserializer: create_deserializer(self.settings.format)?,
            data_schema: self.data_schema(),
            output_schema: self.source_header(),
            max_block_size,
            flush_budget,
            handle_error_mode: self.settings.handle_error_mode,
            skip_broken_messages: match self.settings.handle_error_mode {
                HandleErrorMode::Default => self.settings.skip_broken_messages,
                HandleErrorMode::Stream => 0,
            },
            shutdown: Arc::clone(&self.shutdown_called),
        })
    }

    fn connection(&self) -> Option<NatsConnection> {
        self.connection.lock().clone()
    }

    fn connection_healthy(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connected())
    }

    /// Establishes the single consumer connection if it does not exist.
    async fn ensure_connection(&self) -> Result<(), NatsError> {
        if self.connection.lock().is_some() {
            return Ok(());
        }
        let connection = self.event_loop.create_connection(&self.configuration).await?;
        *self.connection.lock() = Some(connection);
        Ok(())
    }

    /// Builds the consumer pool. Idempotent.
    fn create_consumers(&self) {
        if self.pool.num_created() != 0 {
            return;
        }
        let queue_group = self.settings.queue_group_for(&self.table_id);
        for _ in 0..self.settings.num_consumers {
            self.pool.add(Arc::new(NatsConsumer::new(
                self.settings.subjects.clone(),
                queue_group.clone(),
                self.queue_size,
                self.event_loop.handle().clone(),
            )));
        }
        debug!(
            table = %self.table_id,
            consumers = self.pool.num_created(),
            queue_group = %queue_group,
            "created consumers"
        );
    }

    /// Subscribes every consumer; `consumers_ready` is set only when all
    /// of them subscribed.
    async fn subscribe_consumers(&self) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        let all_subscribed = self.pool.subscribe_all(&connection).await;
        if all_subscribed {
            self.consumers_ready.store(true, Ordering::Release);
        }
        all_subscribed
    }

    /// Unsubscribes every consumer and clears `consumers_ready`.
    async fn unsubscribe_consumers(&self) {
        self.pool.unsubscribe_all().await;
        self.consumers_ready.store(false, Ordering::Release);
    }

    fn reschedule_init(&self) {
        if let Some(task) = self.init_task.get() {
            task.schedule_after(RESCHEDULE_DELAY);
        }
    }

    /// Initializer task body. Every failure point logs and re-arms the
    /// task; nothing propagates out of a background activation.
    async fn initialize_consumers(&self) {
        if self.consumers_ready.load(Ordering::Acquire)
            || self.shutdown_called.load(Ordering::Acquire)
        {
            return;
        }

        if let Err(e) = self.ensure_connection().await {
            warn!(table = %self.table_id, error = %e, "cannot initialize consumers");
            self.reschedule_init();
            return;
        }
        self.create_consumers();

        let num_views = self.catalog.dependent_views(&self.table_id).len();
        if num_views == 0 {
            self.reschedule_init();
            return;
        }
        self.mv_attached.store(true, Ordering::Release);

        if !self.subscribe_consumers().await {
            self.reschedule_init();
            return;
        }

        debug!(table = %self.table_id, views = num_views, "consumers subscribed, streaming armed");
        if let Some(task) = self.streaming_task.get() {
            task.activate_and_schedule();
        }
    }

    /// Returns `true` when at least one dependent view exists and every
    /// one of them resolves (a materialized view also needs its target).
    fn check_dependencies(&self) -> bool {
        let view_ids = self.catalog.dependent_views(&self.table_id);
        if view_ids.is_empty() {
            return false;
        }
        view_ids.iter().all(|id| {
            self.catalog.get_table(id).is_some_and(|entry| {
                entry.as_view().map_or(true, |view| view.target_exists())
            })
        })
    }

    /// Streaming task body: repeat passes while views are attached, then
    /// either re-arm itself or wind down toward idle.
    async fn streaming_func(&self) {
        let mut queues_drained = false;

        if self.connection_healthy() {
            let activation_started = tokio::time::Instant::now();
            self.mv_attached.store(true, Ordering::Release);

            while !self.shutdown_called.load(Ordering::Acquire) && self.pool.num_created() > 0 {
                if !self.check_dependencies() {
                    queues_drained = true;
                    break;
                }
                debug!(table = %self.table_id, "streaming to attached views");
                match self.stream_to_views().await {
                    Ok(true) => {
                        queues_drained = true;
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(table = %self.table_id, error = %e, "streaming pass failed");
                        queues_drained = true;
                        break;
                    }
                }
                if activation_started.elapsed() > MAX_THREAD_WORK_DURATION {
                    trace!(table = %self.table_id, "activation time cap reached, rescheduling");
                    break;
                }
            }
        } else {
            debug!(table = %self.table_id, "connection unhealthy, streaming deferred");
            queues_drained = true;
        }

        if self.shutdown_called.load(Ordering::Acquire) {
            return;
        }

        let streaming_task = self.streaming_task.get();
        let num_views = self.catalog.dependent_views(&self.table_id).len();
        if num_views != 0 {
            if let Some(task) = streaming_task {
                if queues_drained {
                    task.schedule_after(RESCHEDULE_DELAY);
                } else {
                    task.schedule();
                }
            }
            return;
        }

        // no dependent views left: wind down toward idle
        if self.consumers_ready.load(Ordering::Acquire) {
            self.unsubscribe_consumers().await;
        }
        if !queues_drained {
            if let Some(task) = streaming_task {
                task.schedule();
            }
            return;
        }
        if let Some(task) = self.init_task.get() {
            task.schedule();
        }
        self.mv_attached.store(false, Ordering::Release);
        debug!(table = %self.table_id, "streaming idle, initializer re-armed");
    }

    /// One streaming pass: drain every consumer into the dependent views.
    ///
    /// Returns `Ok(true)` when the task should back off before its next
    /// activation: either the queues were drained dry, or the connection
    /// dropped and the queues may be non-empty. The two reasons are
    /// distinguished only in logs.
    async fn stream_to_views(&self) -> Result<bool, NatsError> {
        if self.catalog.get_table(&self.table_id).is_none() {
            return Err(NatsError::Logical(format!(
                "engine table {} does not exist",
                self.table_id
            )));
        }

        let mut views: Vec<Arc<MaterializedView>> = Vec::new();
        for view_id in self.catalog.dependent_views(&self.table_id) {
            if let Some(entry) = self.catalog.get_table(&view_id) {
                if let Some(view) = entry.as_view() {
                    views.push(Arc::clone(view));
                }
            }
        }
        if views.is_empty() {
            return Ok(true);
        }
        let sink = ViewFanoutSink::new(views);

        let block_size = self.settings.max_block_size_for(&self.session);
        let flush_budget = self.settings.flush_interval_for(&self.session);
        let num_consumers = self.pool.num_created();

        let mut sources: Vec<Box<dyn BatchSource>> = Vec::with_capacity(num_consumers);
        let mut queue_probes = Vec::with_capacity(num_consumers);
        for _ in 0..num_consumers {
            let Some(consumer) = self.pool.acquire(Some(RESCHEDULE_DELAY)).await else {
                warn!(table = %self.table_id, "consumer lease timed out, streaming with fewer sources");
                break;
            };
            let params = self.source_params(block_size, flush_budget)?;
            let source = NatsSource::bind(Arc::clone(&self.pool), consumer, params).await;
            queue_probes.push(source.queue_len_handle());
            sources.push(Box::new(source));
        }
        if sources.is_empty() {
            return Ok(true);
        }

        let mut pipe = Pipe::unite(sources, self.source_header());
        let stats = pipe.drain_into(&sink).await?;
        drop(pipe);
        debug!(table = %self.table_id, rows = stats.rows, blocks = stats.batches, "streaming pass complete");

        if !self.connection_healthy() {
            trace!(table = %self.table_id, "rescheduling streaming: connection lost, queues may be non-empty");
            return Ok(true);
        }
        let all_empty = queue_probes
            .iter()
            .all(|len| len.load(Ordering::Relaxed) == 0);
        if all_empty {
            trace!(table = %self.table_id, "rescheduling streaming: queues are empty");
        } else {
            trace!(table = %self.table_id, "rescheduling streaming: queues are not empty");
        }
        Ok(all_empty)
    }

    /// Builds a read pipe over the consumer pool for a direct `SELECT`.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] without an established
    /// connection or consumers, and [`NatsError::QueryNotAllowed`] when
    /// direct selects are disabled or materialized views are attached.
    pub async fn read(
        &self,
        column_names: &[String],
        session: &SessionSettings,
    ) -> Result<Pipe, NatsError> {
        if self.connection().is_none() || self.pool.num_created() == 0 {
            return Err(NatsError::ConnectionFailed(
                "consumer setup is not finished; the connection may not be established".into(),
            ));
        }
        if !session.stream_like_engine_allow_direct_select {
            return Err(NatsError::QueryNotAllowed(
                "direct select is not allowed; enable `stream_like_engine_allow_direct_select`"
                    .into(),
            ));
        }
        if self.mv_attached.load(Ordering::Acquire) {
            return Err(NatsError::QueryNotAllowed(
                "cannot read from the table while materialized views are attached".into(),
            ));
        }
        let connection = self.connection().ok_or_else(|| {
            NatsError::ConnectionFailed("connection is gone".into())
        })?;
        if !connection.is_connected() {
            return Err(NatsError::ConnectionFailed(format!(
                "no connection to {}",
                connection.info_for_log()
            )));
        }

        let projection = self.projection_schema(column_names)?;
        let flush_budget = self.settings.flush_interval_for(session);
        let mut sources: Vec<Box<dyn BatchSource>> = Vec::new();
        for _ in 0..self.pool.num_created() {
            let Some(consumer) = self.pool.acquire(Some(CONSUMER_LEASE_TIMEOUT)).await else {
                break;
            };
            // direct reads deliver rows promptly: one row per block
            let params = self.source_params(1, flush_budget)?;
            let source = NatsSource::bind(Arc::clone(&self.pool), consumer, params).await;
            sources.push(Box::new(ConvertingSource::new(
                Box::new(source),
                projection.clone(),
            )));
        }

        if sources.is_empty() {
            return Ok(Pipe::empty(projection));
        }
        debug!(table = %self.table_id, streams = sources.len(), "starting direct read");
        Ok(Pipe::unite(sources, projection))
    }

    /// Builds an insert sink publishing to one of the engine's subjects.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::AmbiguousWriteSubject`] when no target subject
    /// can be chosen, [`NatsError::BadArguments`] for wildcard or foreign
    /// subjects, and [`NatsError::ConnectionFailed`] when the dedicated
    /// connection cannot be established.
    pub async fn write(&self, session: &SessionSettings) -> Result<MessageSink, NatsError> {
        let subject = match session
            .stream_like_engine_insert_queue
            .as_deref()
            .filter(|queue| !queue.is_empty())
        {
            Some(queue) => queue.to_string(),
            None => {
                if self.settings.subjects.len() > 1 {
                    return Err(NatsError::AmbiguousWriteSubject(
                        "the table reads from multiple subjects; set \
                         `stream_like_engine_insert_queue` to choose the subject to write to"
                            .into(),
                    ));
                }
                self.settings.subjects[0].clone()
            }
        };

        subject::validate_publish_subject(&subject)?;
        if !subject::is_subject_in_subscriptions(&subject, &self.settings.subjects) {
            return Err(NatsError::BadArguments(format!(
                "subject '{subject}' is not among the table's subjects"
            )));
        }

        let mut max_rows = self.settings.max_rows_per_message;
        if self.settings.format == Format::Avro {
            if let Some(rows_in_file) = session.output_format_avro_rows_in_file {
                max_rows = usize::try_from(rows_in_file).unwrap_or(usize::MAX);
            }
        }
        let serializer = create_serializer(self.settings.format)?;

        // writes use a dedicated short-lived connection
        let connection = self.event_loop.create_connection(&self.configuration).await?;
        let producer = NatsProducer::new(connection, subject, Arc::clone(&self.shutdown_called));
        Ok(MessageSink::new(producer, serializer, max_rows.max(1)))
    }

    /// Arms the initializer task. Called once the table is registered.
    pub fn startup(&self) {
        if let Some(task) = self.init_task.get() {
            task.activate_and_schedule();
        }
    }

    /// Stops the engine: tasks first, then broker teardown, then the
    /// event loop. Failures on the way down are logged, never raised.
    pub async fn shutdown(&self, is_drop: bool) {
        self.shutdown_called.store(true, Ordering::Release);

        // streaming first so no pass is in flight when consumers go away
        if let Some(task) = self.streaming_task.get() {
            task.stop().await;
        }
        if let Some(task) = self.init_task.get() {
            task.stop().await;
        }

        if is_drop {
            self.unsubscribe_consumers().await;
        }

        if let Some(connection) = self.connection() {
            if connection.is_connected() {
                if let Err(e) = connection.flush().await {
                    warn!(table = %self.table_id, error = %e, "flush on shutdown failed");
                }
            }
            connection.disconnect().await;
        }

        for _ in 0..self.pool.num_created() {
            if self
                .pool
                .acquire(Some(CONSUMER_LEASE_TIMEOUT))
                .await
                .is_none()
            {
                warn!(table = %self.table_id, "a consumer was not returned to the pool in time");
                break;
            }
        }

        self.event_loop.stop_loop();
        self.event_loop.join();
        info!(table = %self.table_id, "NATS table engine stopped");
    }
}

impl std::fmt::Debug for NatsTableEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsTableEngine")
            .field("table", &self.table_id)
            .field("subjects", &self.settings.subjects)
            .field("mv_attached", &self.is_mv_attached())
            .field("consumers_ready", &self.consumers_ready())
            .finish_non_exhaustive()
    }
}
