use crate::{migrate, open_connection, StorageError};
use chrono::{DateTime, Utc};
use psync_core::{ChannelId, OperationStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Authoritative state of one background operation, as kept by the job runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRow {
    pub operation_id: String,
    pub channel: ChannelId,
    pub total_count: Option<u64>,
    pub processed_count: u64,
    pub successful_count: u64,
    pub failed_count: u64,
    pub status: OperationStatus,
    pub updated_at: DateTime<Utc>,
}

/// System-of-record lookup backing reconciliation.
pub struct OperationLedger {
    conn: Mutex<Connection>,
}

impl OperationLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = open_connection(path.as_ref())?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record_status(&self, row: &OperationRow) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute(
            "
            INSERT INTO operations (
                operation_id,
                channel,
                total_count,
                processed_count,
                successful_count,
                failed_count,
                status,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(operation_id) DO UPDATE SET
                channel=excluded.channel,
                total_count=excluded.total_count,
                processed_count=excluded.processed_count,
                successful_count=excluded.successful_count,
                failed_count=excluded.failed_count,
                status=excluded.status,
                updated_at=excluded.updated_at
            ",
            params![
                row.operation_id,
                row.channel.as_str(),
                row.total_count.map(to_sql_count),
                to_sql_count(row.processed_count),
                to_sql_count(row.successful_count),
                to_sql_count(row.failed_count),
                row.status.as_str(),
                row.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn lookup(&self, operation_id: &str) -> Result<Option<OperationRow>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let raw = conn
            .query_row(
                "
                SELECT operation_id, channel, total_count, processed_count,
                       successful_count, failed_count, status, updated_at
                FROM operations
                WHERE operation_id = ?1
                ",
                params![operation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, channel, total, processed, successful, failed, status, updated_at)) = raw
        else {
            return Ok(None);
        };

        let channel = channel
            .parse::<ChannelId>()
            .map_err(StorageError::Serialization)?;
        let status = status
            .parse::<OperationStatus>()
            .map_err(StorageError::Serialization)?;
        Ok(Some(OperationRow {
            operation_id: id,
            channel,
            total_count: total.map(from_sql_count),
            processed_count: from_sql_count(processed),
            successful_count: from_sql_count(successful),
            failed_count: from_sql_count(failed),
            status,
            updated_at: parse_timestamp(updated_at)?,
        }))
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
}
