//! SQLite persistence layer for connection and device traffic history.
//!
//! Uses `rusqlite` with bundled SQLite. Handles:
//! - Evicted connections, written by the sweeper
//! - Per-device totals and speeds, sampled on an interval
//! - Auto-pruning of data older than the configured retention

mod history;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::core::{ConnectionRecord, DeviceSnapshot};
use crate::error::Result;

/// Manages the SQLite history database.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

/// One evicted connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHistoryRecord {
    pub closed_at: i64,
    pub protocol: String,
    pub initiator: String,
    pub initiator_port: u16,
    pub responder: String,
    pub responder_port: u16,
    pub first_seen: i64,
    pub last_seen: i64,
    pub packets: u64,
    pub bytes: u64,
}

impl ConnectionHistoryRecord {
    pub fn from_closed(conn: &ConnectionRecord, closed_at: DateTime<Utc>) -> Self {
        Self {
            closed_at: closed_at.timestamp(),
            protocol: conn.key.protocol.to_string(),
            initiator: conn.initiator.address.to_string(),
            initiator_port: conn.initiator.port,
            responder: conn.responder.address.to_string(),
            responder_port: conn.responder.port,
            first_seen: conn.first_seen.timestamp(),
            last_seen: conn.last_seen.timestamp(),
            packets: conn.packets,
            bytes: conn.bytes,
        }
    }
}

/// A single device traffic sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTrafficRecord {
    pub timestamp: i64,
    pub address: String,
    pub hostname: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub upload_speed: f64,
    pub download_speed: f64,
}

impl DeviceTrafficRecord {
    pub fn from_device(device: &DeviceSnapshot, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: timestamp.timestamp(),
            address: device.address.to_string(),
            hostname: device.hostname.clone(),
            bytes_sent: device.bytes_sent,
            bytes_received: device.bytes_received,
            upload_speed: device.upload_speed,
            download_speed: device.download_speed,
        }
    }
}

/// Traffic a device moved within a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTrafficSummary {
    pub address: String,
    pub hostname: Option<String>,
    pub total_sent: u64,
    pub total_received: u64,
    pub total_bytes: u64,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS connection_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        closed_at INTEGER NOT NULL,
        protocol TEXT NOT NULL,
        initiator TEXT NOT NULL,
        initiator_port INTEGER NOT NULL,
        responder TEXT NOT NULL,
        responder_port INTEGER NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        packets INTEGER NOT NULL DEFAULT 0,
        bytes INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_connection_closed ON connection_history(closed_at);
    CREATE INDEX IF NOT EXISTS idx_connection_initiator ON connection_history(initiator);
    CREATE INDEX IF NOT EXISTS idx_connection_responder ON connection_history(responder);

    CREATE TABLE IF NOT EXISTS device_traffic (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp INTEGER NOT NULL,
        address TEXT NOT NULL,
        hostname TEXT,
        bytes_sent INTEGER NOT NULL DEFAULT 0,
        bytes_received INTEGER NOT NULL DEFAULT 0,
        upload_speed REAL NOT NULL DEFAULT 0.0,
        download_speed REAL NOT NULL DEFAULT 0.0
    );
    CREATE INDEX IF NOT EXISTS idx_device_timestamp ON device_traffic(timestamp);
    CREATE INDEX IF NOT EXISTS idx_device_address ON device_traffic(address);
";

impl HistoryStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        // WAL keeps readers from blocking the periodic writers.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}
