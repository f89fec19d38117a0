//! SQLite record sources for usage accounting.
//!
//! Holds the two upstream tables the engine replays and serves them back as
//! lazy, sorted record sources.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Record sources borrow the connection, so a replay runs on the thread that
//! owns the database.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in UTC RFC 3339 with microseconds
//! (e.g., `2016-09-01T10:00:00.000000Z`). The format is fixed width, so
//! lexicographic ordering matches chronological ordering and range filters
//! and keyset pagination can compare strings.
//!
//! ## Event Table
//!
//! `event_table` stores every upstream event; only rows named
//! `instance_allocation_source_changed` are read back. The `payload` column
//! stores the event payload as JSON text.

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use serde_json::{Map, Value, json};
use thiserror::Error;
use usage_core::record::{
    AllocationChangeRecord, StatusHistoryRecord, format_timestamp, parse_timestamp,
};
use usage_core::{ALLOCATION_SOURCE_CHANGED, Record, RecordStream, SourceError};

/// Default number of rows fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored event payload is not valid JSON.
    #[error("invalid payload for event {event_id}")]
    InvalidPayload {
        event_id: i64,
        #[source]
        source: serde_json::Error,
    },
    /// A payload could not be encoded for storage.
    #[error("failed to encode payload for event {event_id}")]
    EncodePayload {
        event_id: i64,
        #[source]
        source: serde_json::Error,
    },
    /// A stored timestamp is not in the expected format.
    #[error("invalid stored timestamp {value:?}")]
    InvalidTimestamp { value: String },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// Row counts and time span of the stored data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub status_history: u64,
    pub allocation_changes: u64,
    /// Event-table rows with any other name.
    pub other_events: u64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        tracing::debug!(path = %path.display(), "opened database");
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            -- One row per status/activity change of an instance
            -- start_date: UTC RFC 3339 with microseconds
            CREATE TABLE IF NOT EXISTS instance_status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                activity TEXT,
                size_cpu INTEGER NOT NULL,
                status_name TEXT NOT NULL,
                start_date TEXT NOT NULL,
                username TEXT NOT NULL,
                UNIQUE (instance_id, start_date, status_name)
            );

            CREATE INDEX IF NOT EXISTS idx_status_history_start
                ON instance_status_history(start_date, id);

            -- Upstream events; payload is JSON text
            CREATE TABLE IF NOT EXISTS event_table (
                id INTEGER PRIMARY KEY,
                uuid TEXT NOT NULL UNIQUE,
                entity_id TEXT NOT NULL,
                name TEXT NOT NULL,
                payload TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_event_table_name_timestamp
                ON event_table(name, timestamp, id);
            ",
        )?;
        Ok(())
    }

    /// Inserts status history rows, ignoring duplicates.
    pub fn insert_status_history(
        &mut self,
        records: &[StatusHistoryRecord],
    ) -> Result<usize, DbError> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO instance_status_history
                (instance_id, activity, size_cpu, status_name, start_date, username)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )?;
            for record in records {
                inserted += stmt.execute(params![
                    record.instance_id.as_str(),
                    record.activity,
                    record.size_cpu,
                    record.status_name,
                    format_timestamp(record.start_date),
                    record.username.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(inserted, total = records.len(), "stored status history");
        Ok(inserted)
    }

    /// Inserts event-table rows, ignoring duplicates by id or uuid.
    pub fn insert_allocation_changes(
        &mut self,
        records: &[AllocationChangeRecord],
    ) -> Result<usize, DbError> {
        if records.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO event_table
                (id, uuid, entity_id, name, payload, timestamp)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )?;
            for record in records {
                let payload = serde_json::to_string(&record.payload).map_err(|source| {
                    DbError::EncodePayload {
                        event_id: record.id,
                        source,
                    }
                })?;
                inserted += stmt.execute(params![
                    record.id,
                    record.uuid.to_string(),
                    record.entity_id,
                    record.name,
                    payload,
                    format_timestamp(record.timestamp),
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(inserted, total = records.len(), "stored allocation changes");
        Ok(inserted)
    }

    /// Status history up to and including `end`, ascending by start date.
    pub fn status_history(&self, end: DateTime<Utc>, page_size: usize) -> PagedRecords<'_> {
        PagedRecords::new(&self.conn, Table::StatusHistory, end, page_size)
    }

    /// Allocation changes up to and including `end`, ascending by timestamp.
    pub fn allocation_changes(&self, end: DateTime<Utc>, page_size: usize) -> PagedRecords<'_> {
        PagedRecords::new(&self.conn, Table::AllocationChanges, end, page_size)
    }

    /// [`Self::status_history`] as an engine record source.
    pub fn status_history_source(&self, end: DateTime<Utc>, page_size: usize) -> RecordStream<'_> {
        Box::new(
            self.status_history(end, page_size)
                .map(|record| record.map_err(SourceError::from)),
        )
    }

    /// [`Self::allocation_changes`] as an engine record source.
    pub fn allocation_changes_source(
        &self,
        end: DateTime<Utc>,
        page_size: usize,
    ) -> RecordStream<'_> {
        Box::new(
            self.allocation_changes(end, page_size)
                .map(|record| record.map_err(SourceError::from)),
        )
    }

    /// Counts stored rows.
    pub fn record_counts(&self) -> Result<RecordCounts, DbError> {
        let status_history: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM instance_status_history", [], |row| {
                    row.get(0)
                })?;
        let (allocation_changes, other_events): (i64, i64) = self.conn.query_row(
            "
            SELECT
                COALESCE(SUM(CASE WHEN name = ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN name = ?1 THEN 0 ELSE 1 END), 0)
            FROM event_table
            ",
            [ALLOCATION_SOURCE_CHANGED],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (earliest, latest): (Option<String>, Option<String>) = self.conn.query_row(
            "
            SELECT MIN(at), MAX(at) FROM (
                SELECT start_date AS at FROM instance_status_history
                UNION ALL
                SELECT timestamp AS at FROM event_table WHERE name = ?1
            )
            ",
            [ALLOCATION_SOURCE_CHANGED],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(RecordCounts {
            status_history: u64::try_from(status_history).unwrap_or_default(),
            allocation_changes: u64::try_from(allocation_changes).unwrap_or_default(),
            other_events: u64::try_from(other_events).unwrap_or_default(),
            earliest: earliest.as_deref().map(stored_timestamp).transpose()?,
            latest: latest.as_deref().map(stored_timestamp).transpose()?,
        })
    }
}

fn stored_timestamp(value: &str) -> Result<DateTime<Utc>, DbError> {
    parse_timestamp(value).ok_or_else(|| DbError::InvalidTimestamp {
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    StatusHistory,
    AllocationChanges,
}

impl Table {
    /// Keyset page query. Parameters: end, last key, last id, limit.
    const fn page_sql(self) -> &'static str {
        match self {
            Self::StatusHistory => {
                "
                SELECT id, instance_id, activity, size_cpu, status_name, start_date, username
                FROM instance_status_history
                WHERE start_date <= ?1 AND (start_date, id) > (?2, ?3)
                ORDER BY start_date ASC, id ASC
                LIMIT ?4
                "
            }
            Self::AllocationChanges => {
                "
                SELECT id, uuid, entity_id, name, payload, timestamp
                FROM event_table
                WHERE name = ?5 AND timestamp <= ?1 AND (timestamp, id) > (?2, ?3)
                ORDER BY timestamp ASC, id ASC
                LIMIT ?4
                "
            }
        }
    }
}

/// A fetched row: its keyset cursor plus the record, or a payload error.
type PageRow = (String, i64, Result<Record, DbError>);

fn status_history_row(row: &Row<'_>) -> rusqlite::Result<PageRow> {
    let id: i64 = row.get(0)?;
    let start_date: String = row.get(5)?;
    let mut fields = Map::new();
    fields.insert("instance_id".to_string(), json!(row.get::<_, String>(1)?));
    fields.insert("activity".to_string(), json!(row.get::<_, Option<String>>(2)?));
    fields.insert("size_cpu".to_string(), json!(row.get::<_, i64>(3)?));
    fields.insert("status_name".to_string(), json!(row.get::<_, String>(4)?));
    fields.insert("start_date".to_string(), json!(start_date));
    fields.insert("username".to_string(), json!(row.get::<_, String>(6)?));
    Ok((start_date, id, Ok(Record::new(fields))))
}

fn allocation_change_row(row: &Row<'_>) -> rusqlite::Result<PageRow> {
    let id: i64 = row.get(0)?;
    let timestamp: String = row.get(5)?;
    let payload: String = row.get(4)?;
    let payload = serde_json::from_str::<Value>(&payload)
        .map_err(|source| DbError::InvalidPayload {
            event_id: id,
            source,
        });

    let record = match payload {
        Ok(payload) => {
            let mut fields = Map::new();
            fields.insert("id".to_string(), json!(id));
            fields.insert("uuid".to_string(), json!(row.get::<_, String>(1)?));
            fields.insert("entity_id".to_string(), json!(row.get::<_, String>(2)?));
            fields.insert("name".to_string(), json!(row.get::<_, String>(3)?));
            fields.insert("payload".to_string(), payload);
            fields.insert("timestamp".to_string(), json!(timestamp));
            Ok(Record::new(fields))
        }
        Err(err) => Err(err),
    };
    Ok((timestamp, id, record))
}

/// Lazily pages through one table in key order.
///
/// Holds at most one page in memory. The first error ends the sequence.
pub struct PagedRecords<'a> {
    conn: &'a Connection,
    table: Table,
    end: String,
    page_size: usize,
    cursor: (String, i64),
    buffer: VecDeque<Result<Record, DbError>>,
    exhausted: bool,
}

impl<'a> PagedRecords<'a> {
    fn new(conn: &'a Connection, table: Table, end: DateTime<Utc>, page_size: usize) -> Self {
        Self {
            conn,
            table,
            end: format_timestamp(end),
            page_size: page_size.max(1),
            cursor: (String::new(), i64::MIN),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fetch_page(&mut self) -> Result<(), DbError> {
        let limit = i64::try_from(self.page_size).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare_cached(self.table.page_sql())?;
        let (last_key, last_id) = &self.cursor;
        let rows = match self.table {
            Table::StatusHistory => stmt
                .query_map(params![self.end, last_key, last_id, limit], status_history_row)?
                .collect::<Result<Vec<_>, _>>()?,
            Table::AllocationChanges => stmt
                .query_map(
                    params![self.end, last_key, last_id, limit, ALLOCATION_SOURCE_CHANGED],
                    allocation_change_row,
                )?
                .collect::<Result<Vec<_>, _>>()?,
        };

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        tracing::trace!(table = ?self.table, rows = rows.len(), "fetched page");
        for (key, id, record) in rows {
            self.cursor = (key, id);
            self.buffer.push_back(record);
        }
        Ok(())
    }
}

impl Iterator for PagedRecords<'_> {
    type Item = Result<Record, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let item = self.buffer.pop_front()?;
        if item.is_err() {
            self.exhausted = true;
            self.buffer.clear();
        }
        Some(item)
    }
}
