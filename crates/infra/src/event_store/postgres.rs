//! Postgres-backed event store implementation.
//!
//! Three tables:
//!
//! - `streams`: one row per stream holding its current version. A commit locks every
//!   stream it touches (`SELECT ... FOR UPDATE`, in sorted order to avoid deadlocks),
//!   which is what makes read validation and the append one serializable step.
//! - `events`: the append-only log, unique on `(aggregate_type, aggregate_id,
//!   sequence_number)`, with a `BIGSERIAL` global position.
//! - projection tables written by [`SqlProjection`]s in the same transaction
//!   (e.g. `stock_levels`).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Concurrency` |
//! | Database (check constraint violation) | `23514` | `Projection` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / other | N/A | `Database` |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{instrument, Span};

use fieldstock_core::AggregateId;

use super::r#trait::{
    validate_batch, EventStore, EventStoreError, InlineProjection, StoredEvent, StreamAppend,
    StreamId,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS streams (
        aggregate_type TEXT NOT NULL,
        aggregate_id UUID NOT NULL,
        version BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (aggregate_type, aggregate_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        position BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL UNIQUE,
        aggregate_type TEXT NOT NULL,
        aggregate_id UUID NOT NULL,
        sequence_number BIGINT NOT NULL CHECK (sequence_number > 0),
        event_type TEXT NOT NULL,
        event_version INT NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (aggregate_type, aggregate_id, sequence_number)
    )
    "#,
];

/// Read model kept in SQL, written inside the commit transaction.
#[async_trait::async_trait]
pub trait SqlProjection: Send + Sync {
    fn name(&self) -> &'static str;

    /// DDL statements, run by [`PostgresEventStore::ensure_schema`].
    fn schema(&self) -> &'static [&'static str];

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        events: &[StoredEvent],
    ) -> Result<(), EventStoreError>;
}

/// Postgres-backed append-only event store.
///
/// Process-local inline projections are applied after the SQL commit while a commit
/// gate is held, so they see commits in the order Postgres accepted them. They are
/// rebuilt from [`EventStore::load_all`] at startup.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    sql_projections: Vec<Arc<dyn SqlProjection>>,
    projections: Vec<Arc<dyn InlineProjection>>,
    commit_gate: Arc<tokio::sync::Mutex<()>>,
}

impl core::fmt::Debug for PostgresEventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresEventStore")
            .field(
                "sql_projections",
                &self.sql_projections.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "projections",
                &self.projections.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl PostgresEventStore {
    /// Create a new PostgresEventStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            sql_projections: Vec::new(),
            projections: Vec::new(),
            commit_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Connect a small pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_sql_projection(mut self, projection: Arc<dyn SqlProjection>) -> Self {
        self.sql_projections.push(projection);
        self
    }

    pub fn with_projections(mut self, projections: Vec<Arc<dyn InlineProjection>>) -> Self {
        self.projections.extend(projections);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Install the event tables and every registered SQL projection's tables.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        let projection_ddl = self.sql_projections.iter().flat_map(|p| p.schema().iter());
        for statement in SCHEMA.iter().chain(projection_ddl) {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Insert one stream's events inside an open transaction.
    async fn insert_events(
        tx: &mut Transaction<'_, Postgres>,
        append: &StreamAppend,
        current_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut stored_events = Vec::with_capacity(append.events.len());
        let mut next_sequence = current_version + 1;

        for event in &append.events {
            let row = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    aggregate_type,
                    aggregate_id,
                    sequence_number,
                    event_type,
                    event_version,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING position
                "#,
            )
            .bind(event.event_id)
            .bind(&append.stream.aggregate_type)
            .bind(append.stream.aggregate_id.as_uuid())
            .bind(next_sequence as i64)
            .bind(&event.event_type)
            .bind(event.event_version as i32)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "concurrent append detected: {}#{next_sequence} already exists",
                        append.stream
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            let position: i64 = row
                .try_get("position")
                .map_err(|e| EventStoreError::Database(format!("failed to read position: {e}")))?;

            stored_events.push(StoredEvent {
                event_id: event.event_id,
                aggregate_id: append.stream.aggregate_id,
                aggregate_type: append.stream.aggregate_type.clone(),
                sequence_number: next_sequence,
                position: position as u64,
                event_type: event.event_type.clone(),
                event_version: event.event_version,
                occurred_at: event.occurred_at,
                payload: event.payload.clone(),
            });
            next_sequence += 1;
        }

        if !append.events.is_empty() {
            sqlx::query(
                "UPDATE streams SET version = $3 WHERE aggregate_type = $1 AND aggregate_id = $2",
            )
            .bind(&append.stream.aggregate_type)
            .bind(append.stream.aggregate_id.as_uuid())
            .bind((next_sequence - 1) as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("update_stream_version", e))?;
        }

        Ok(stored_events)
    }

    async fn commit_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        batch: &[StreamAppend],
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        // Lock streams in a stable order so concurrent commits cannot deadlock.
        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.sort_by(|a, b| batch[*a].stream.cmp(&batch[*b].stream));

        let mut versions = vec![0u64; batch.len()];
        for idx in order {
            let append = &batch[idx];
            let current = lock_stream(tx, &append.stream).await?;
            if !append.expected.matches(current) {
                return Err(EventStoreError::Concurrency(format!(
                    "stream {}: expected {:?}, found {current}",
                    append.stream, append.expected
                )));
            }
            versions[idx] = current;
        }

        // Appends keep batch order so global positions follow the operation's intent.
        let mut committed = Vec::new();
        for (append, current) in batch.iter().zip(versions) {
            committed.extend(Self::insert_events(tx, append, current).await?);
        }

        if committed.is_empty() {
            return Ok(committed);
        }

        for projection in &self.projections {
            projection.check(&committed)?;
        }
        for projection in &self.sql_projections {
            projection.apply(tx, &committed).await?;
        }

        Ok(committed)
    }
}

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    /// Load all events of one stream, in sequence order.
    #[instrument(
        skip(self),
        fields(
            aggregate_type = %stream.aggregate_type,
            aggregate_id = %stream.aggregate_id,
            event_count
        ),
        err
    )]
    async fn load_stream(&self, stream: &StreamId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                position,
                event_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload,
                created_at
            FROM events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(&stream.aggregate_type)
        .bind(stream.aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let stored_events = decode_rows(rows)?;
        Span::current().record("event_count", stored_events.len());
        Ok(stored_events)
    }

    /// Commit a multi-stream batch in one transaction.
    ///
    /// Any failure rolls the whole transaction back (the `Transaction` is dropped without
    /// commit).
    #[instrument(
        skip(self, batch),
        fields(
            streams = batch.len(),
            event_count = batch.iter().map(|a| a.events.len()).sum::<usize>(),
            committed_events
        ),
        err
    )]
    async fn commit(&self, batch: Vec<StreamAppend>) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(&batch)?;

        let _gate = self.commit_gate.lock().await;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let committed = self.commit_in_tx(&mut tx, &batch).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        for projection in &self.projections {
            projection.apply(&committed);
        }

        Span::current().record("committed_events", committed.len());
        Ok(committed)
    }

    #[instrument(skip(self), fields(event_count), err)]
    async fn load_all(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                position,
                event_id,
                aggregate_id,
                aggregate_type,
                sequence_number,
                event_type,
                event_version,
                occurred_at,
                payload,
                created_at
            FROM events
            ORDER BY position ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_all", e))?;

        let stored_events = decode_rows(rows)?;
        Span::current().record("event_count", stored_events.len());
        Ok(stored_events)
    }
}

/// Make sure the stream row exists, then lock it and return its version.
///
/// Creating the row first means a read-only entry for a stream nobody has written yet
/// still takes a lock, so a concurrent first append waits for this transaction.
async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream: &StreamId,
) -> Result<u64, EventStoreError> {
    sqlx::query(
        r#"
        INSERT INTO streams (aggregate_type, aggregate_id, version)
        VALUES ($1, $2, 0)
        ON CONFLICT (aggregate_type, aggregate_id) DO NOTHING
        "#,
    )
    .bind(&stream.aggregate_type)
    .bind(stream.aggregate_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("create_stream", e))?;

    let row = sqlx::query(
        r#"
        SELECT version
        FROM streams
        WHERE aggregate_type = $1 AND aggregate_id = $2
        FOR UPDATE
        "#,
    )
    .bind(&stream.aggregate_type)
    .bind(stream.aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_stream", e))?;

    let version: i64 = row
        .try_get("version")
        .map_err(|e| EventStoreError::Database(format!("failed to read version: {e}")))?;
    Ok(version as u64)
}

fn decode_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<StoredEvent>, EventStoreError> {
    let mut stored_events = Vec::with_capacity(rows.len());
    for row in rows {
        let stored = StoredEventRow::from_row(&row)
            .map_err(|e| EventStoreError::Database(format!("failed to deserialize event row: {e}")))?;
        stored_events.push(stored.into());
    }
    Ok(stored_events)
}

/// Map SQLx errors to EventStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                // Unique violation: somebody else appended first.
                Some("23505") => EventStoreError::Concurrency(msg),
                // Check constraint, e.g. a stock level going negative.
                Some("23514") => EventStoreError::Projection(msg),
                _ => EventStoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Database(format!("connection pool closed in {}", operation))
        }
        _ => EventStoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    position: i64,
    event_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    event_version: i32,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
    #[allow(dead_code)] // audit column, not part of StoredEvent
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            position: row.try_get("position")?,
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            position: row.position as u64,
            event_type: row.event_type,
            event_version: row.event_version as u32,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}
