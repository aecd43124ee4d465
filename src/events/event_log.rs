//! # Event Log
//!
//! Durable, capped, globally ordered store of task events backed by SQLite.
//!
//! The log is the sole owner of the sequence counter. Sequence assignment, the
//! insert, and cap eviction happen inside one transaction while the counter
//! mutex is held, so no two writers can interleave. Eviction is global: once
//! the table holds more than `max_events` rows the oldest rows are deleted
//! regardless of which task they belong to.

use crate::config::EventLogConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::types::{Event, EventId, EventType, NewEvent};
use crate::logging::log_error;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};

const EVENT_COLUMNS: &str = "sequence, timestamp, event_type, task_id, data";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    timestamp: i64,
    event_type: String,
    task_id: String,
    data: String,
}

impl TryFrom<EventRow> for Event {
    type Error = RelayError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_type = EventType::from_str(&row.event_type)
            .map_err(RelayError::PersistenceError)?;
        Ok(Event {
            id: EventId(row.sequence),
            timestamp: row.timestamp,
            event_type,
            task_id: row.task_id,
            data: serde_json::from_str(&row.data)?,
        })
    }
}

pub struct EventLog {
    pool: SqlitePool,
    max_events: usize,
    /// Last assigned sequence; the lock also serializes appends
    last_sequence: Mutex<i64>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("max_events", &self.max_events)
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl EventLog {
    /// Open (or create) the log and resume the sequence counter from storage
    pub async fn open(config: &EventLogConfig) -> RelayResult<Self> {
        let options =
            SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);

        // An in-memory database lives and dies with its single connection.
        let pool = if config.database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await?
        };

        Self::create_schema(&pool).await?;

        let last_sequence: Option<i64> = sqlx::query_scalar("SELECT MAX(sequence) FROM events")
            .fetch_one(&pool)
            .await?;
        let last_sequence = last_sequence.unwrap_or(0);

        info!(
            database_url = %config.database_url,
            max_events = config.max_events,
            last_sequence = last_sequence,
            "🗄️ Event log opened"
        );

        Ok(Self {
            pool,
            max_events: config.max_events,
            last_sequence: Mutex::new(last_sequence),
        })
    }

    /// Open a private in-memory log with the given cap
    pub async fn in_memory(max_events: usize) -> RelayResult<Self> {
        Self::open(&EventLogConfig {
            max_events,
            ..EventLogConfig::in_memory()
        })
        .await
    }

    async fn create_schema(pool: &SqlitePool) -> RelayResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                sequence INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                task_id TEXT NOT NULL,
                data TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_task_id ON events(task_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Assign the next sequence id and durably append the event.
    ///
    /// Fails with `PersistenceError` when the write does not commit; the
    /// sequence counter only advances on success.
    pub async fn store_event(&self, event: NewEvent) -> RelayResult<Event> {
        let data = serde_json::to_string(&event.data)?;
        let mut last_sequence = self.last_sequence.lock().await;
        let sequence = *last_sequence + 1;
        let timestamp = Utc::now().timestamp_millis();

        let evicted = match self.append(sequence, timestamp, &event, &data).await {
            Ok(evicted) => evicted,
            Err(e) => {
                log_error(
                    "EventLog",
                    "store_event",
                    &e.to_string(),
                    Some(&format!("task_id={} sequence={sequence}", event.task_id)),
                );
                return Err(e);
            }
        };
        *last_sequence = sequence;

        debug!(
            event_id = sequence,
            task_id = %event.task_id,
            event_type = %event.event_type,
            evicted = evicted,
            "Stored event"
        );

        Ok(Event {
            id: EventId(sequence),
            timestamp,
            event_type: event.event_type,
            task_id: event.task_id,
            data: event.data,
        })
    }

    async fn append(
        &self,
        sequence: i64,
        timestamp: i64,
        event: &NewEvent,
        data: &str,
    ) -> RelayResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO events (sequence, timestamp, event_type, task_id, data)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(sequence)
        .bind(timestamp)
        .bind(event.event_type.as_str())
        .bind(&event.task_id)
        .bind(data)
        .execute(&mut *tx)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&mut *tx)
            .await?;
        let overflow = count - self.max_events as i64;

        let mut evicted = 0;
        if overflow > 0 {
            evicted = sqlx::query(
                "DELETE FROM events WHERE sequence IN (
                    SELECT sequence FROM events ORDER BY sequence ASC LIMIT ?
                )",
            )
            .bind(overflow)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(evicted)
    }

    /// All retained events for a task, in storage order
    pub async fn get_events_by_task_id(&self, task_id: &str) -> RelayResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE task_id = ? ORDER BY sequence ASC"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Event::try_from).collect()
    }

    /// All retained events after `last_event_id`, in order.
    ///
    /// A missing cursor, or one that is no longer (or never was) retained,
    /// selects every retained event.
    pub async fn get_events_since(&self, last_event_id: Option<EventId>) -> RelayResult<Vec<Event>> {
        let after = self.resolve_cursor(last_event_id).await?;
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE sequence > ? ORDER BY sequence ASC"
        ))
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Event::try_from).collect()
    }

    /// `get_events_since` restricted to one task
    pub async fn get_task_events_since(
        &self,
        task_id: &str,
        last_event_id: Option<EventId>,
    ) -> RelayResult<Vec<Event>> {
        let after = self.resolve_cursor(last_event_id).await?;
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE task_id = ? AND sequence > ? ORDER BY sequence ASC"
        ))
        .bind(task_id)
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Event::try_from).collect()
    }

    async fn resolve_cursor(&self, last_event_id: Option<EventId>) -> RelayResult<i64> {
        match last_event_id {
            Some(id) if self.contains(id).await? => Ok(id.sequence()),
            _ => Ok(0),
        }
    }

    pub async fn contains(&self, id: EventId) -> RelayResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT sequence FROM events WHERE sequence = ?")
            .bind(id.sequence())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn count(&self) -> RelayResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Oldest and newest retained ids, or `None` for an empty log
    pub async fn bounds(&self) -> RelayResult<Option<(EventId, EventId)>> {
        let (oldest, newest): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT MIN(sequence), MAX(sequence) FROM events")
                .fetch_one(&self.pool)
                .await?;
        Ok(oldest.zip(newest).map(|(o, n)| (EventId(o), EventId(n))))
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Release the underlying pool; later operations fail with `PersistenceError`
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("🗄️ Event log closed");
        }
    }
}
