//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use super::traits::{DeviceStore, MonitorFlagStore, RuntimeStore};

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }
}

// --- Devices ---

impl DeviceStore for Store {
    fn add_device(&self, device: &mut Device) -> Result<i64, DbError> {
        let connection_settings = serde_json::to_string(&device.connection_settings)?;
        let variable_settings = serde_json::to_string(&device.variable_settings)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO devices (name, category, driver, connection_settings, variable_settings) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                device.name,
                device.category.as_str(),
                device.driver,
                connection_settings,
                variable_settings,
            ],
        )?;
        let id = conn.last_insert_rowid();
        device.id = id;
        Ok(id)
    }

    fn update_device(&self, device: &Device) -> Result<(), DbError> {
        let connection_settings = serde_json::to_string(&device.connection_settings)?;
        let variable_settings = serde_json::to_string(&device.variable_settings)?;

        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET name=?1, category=?2, driver=?3, connection_settings=?4, variable_settings=?5 WHERE id=?6",
            params![
                device.name,
                device.category.as_str(),
                device.driver,
                connection_settings,
                variable_settings,
                device.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    fn get_device(&self, id: i64) -> Result<Option<Device>, DbError> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                "SELECT id, name, category, driver, connection_settings, variable_settings FROM devices WHERE id = ?1",
                params![id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn get_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, category, driver, connection_settings, variable_settings FROM devices ORDER BY id",
        )?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(devices)
    }

    /// Delete a device together with its runtime history and monitor flag.
    fn delete_device(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM runtime_intervals WHERE device_id = ?1", params![id])?;
        tx.execute("DELETE FROM monitor_flags WHERE device_id = ?1", params![id])?;
        tx.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

// --- Runtime intervals ---

impl RuntimeStore for Store {
    fn append(&self, interval: &RuntimeInterval) -> Result<(), DbError> {
        let conn = self.conn()?;
        insert_interval(&conn, interval)?;
        Ok(())
    }

    fn update_most_recent(&self, interval: &RuntimeInterval) -> Result<(), DbError> {
        let conn = self.conn()?;
        update_interval(&conn, interval)
    }

    fn transition(&self, closed: &RuntimeInterval, opened: &RuntimeInterval) -> Result<(), DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        update_interval(&tx, closed)?;
        insert_interval(&tx, opened)?;
        tx.commit()?;
        Ok(())
    }

    fn query_range(
        &self,
        device_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RuntimeInterval>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, status, start_time, end_time FROM runtime_intervals
             WHERE device_id = ?1 AND (end_time IS NULL OR end_time > ?2) AND start_time < ?3
             ORDER BY start_time ASC",
        )?;
        let intervals = stmt
            .query_map(
                params![device_id, fmt_db_time(from), fmt_db_time(to)],
                interval_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(intervals)
    }

    fn get_latest(&self, device_id: i64) -> Result<Option<RuntimeInterval>, DbError> {
        let conn = self.conn()?;
        let interval = conn
            .query_row(
                "SELECT device_id, status, start_time, end_time FROM runtime_intervals
                 WHERE device_id = ?1 ORDER BY start_time DESC LIMIT 1",
                params![device_id],
                interval_from_row,
            )
            .optional()?;
        Ok(interval)
    }

    fn get_earliest(&self, device_id: i64) -> Result<Option<RuntimeInterval>, DbError> {
        let conn = self.conn()?;
        let interval = conn
            .query_row(
                "SELECT device_id, status, start_time, end_time FROM runtime_intervals
                 WHERE device_id = ?1 ORDER BY start_time ASC LIMIT 1",
                params![device_id],
                interval_from_row,
            )
            .optional()?;
        Ok(interval)
    }

    fn delete_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM runtime_intervals WHERE end_time IS NOT NULL AND end_time < ?1",
            params![fmt_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

// --- Monitor flags ---

impl MonitorFlagStore for Store {
    fn get_flag(&self, device_id: i64) -> Result<Option<MonitorFlag>, DbError> {
        let conn = self.conn()?;
        let flag = conn
            .query_row(
                "SELECT device_id, is_monitoring FROM monitor_flags WHERE device_id = ?1",
                params![device_id],
                |row| {
                    Ok(MonitorFlag {
                        device_id: row.get(0)?,
                        is_monitoring: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(flag)
    }

    fn upsert_flag(&self, flag: &MonitorFlag) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO monitor_flags (device_id, is_monitoring) VALUES (?1, ?2)
             ON CONFLICT(device_id) DO UPDATE SET is_monitoring=excluded.is_monitoring",
            params![flag.device_id, flag.is_monitoring],
        )?;
        Ok(())
    }

    fn delete_flag(&self, device_id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM monitor_flags WHERE device_id = ?1", params![device_id])?;
        Ok(())
    }

    fn get_flags(&self) -> Result<Vec<MonitorFlag>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT device_id, is_monitoring FROM monitor_flags ORDER BY device_id")?;
        let flags = stmt
            .query_map([], |row| {
                Ok(MonitorFlag {
                    device_id: row.get(0)?,
                    is_monitoring: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(flags)
    }
}

fn insert_interval(conn: &Connection, interval: &RuntimeInterval) -> SqlResult<usize> {
    conn.execute(
        "INSERT INTO runtime_intervals (device_id, status, start_time, end_time) VALUES (?1, ?2, ?3, ?4)",
        params![
            interval.device_id,
            interval.status.code(),
            fmt_db_time(interval.start_time),
            interval.end_time.map(fmt_db_time),
        ],
    )
}

fn update_interval(conn: &Connection, interval: &RuntimeInterval) -> Result<(), DbError> {
    let changed = conn.execute(
        "UPDATE runtime_intervals SET status = ?1, end_time = ?2 WHERE device_id = ?3 AND start_time = ?4",
        params![
            interval.status.code(),
            interval.end_time.map(fmt_db_time),
            interval.device_id,
            fmt_db_time(interval.start_time),
        ],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

fn device_from_row(row: &Row<'_>) -> SqlResult<Device> {
    let category: String = row.get(2)?;
    let connection_settings: String = row.get(4)?;
    let variable_settings: String = row.get(5)?;

    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        category: Category::parse(&category)
            .ok_or_else(|| conversion_error(2, format!("unknown category: {}", category)))?,
        driver: row.get(3)?,
        connection_settings: serde_json::from_str(&connection_settings)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        variable_settings: serde_json::from_str(&variable_settings)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
    })
}

fn interval_from_row(row: &Row<'_>) -> SqlResult<RuntimeInterval> {
    let code: i64 = row.get(1)?;
    let start: String = row.get(2)?;
    let end: Option<String> = row.get(3)?;

    let end_time = match end {
        Some(s) => Some(parse_db_time(&s).ok_or_else(|| conversion_error(3, format!("invalid end_time: {}", s)))?),
        None => None,
    };

    Ok(RuntimeInterval {
        device_id: row.get(0)?,
        status: Status::from_code(code).ok_or(rusqlite::Error::IntegralValueOutOfRange(1, code))?,
        start_time: parse_db_time(&start)
            .ok_or_else(|| conversion_error(2, format!("invalid start_time: {}", start)))?,
        end_time,
    })
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

/// Format a timestamp so that text ordering matches time ordering.
fn fmt_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        DB_TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
