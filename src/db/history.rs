//! History table CRUD operations.

use chrono::Utc;
use rusqlite::params;

use super::{ConnectionHistoryRecord, DeviceTrafficRecord, DeviceTrafficSummary, HistoryStore};
use crate::error::Result;

impl HistoryStore {
    /// Insert a batch of evicted connections in one transaction.
    pub fn insert_connections(&self, records: &[ConnectionHistoryRecord]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO connection_history (closed_at, protocol, initiator, initiator_port, responder, responder_port, first_seen, last_seen, packets, bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.closed_at,
                    r.protocol,
                    r.initiator,
                    r.initiator_port,
                    r.responder,
                    r.responder_port,
                    r.first_seen,
                    r.last_seen,
                    r.packets,
                    r.bytes,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert a batch of device samples (called every history interval).
    pub fn insert_device_batch(&self, records: &[DeviceTrafficRecord]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO device_traffic (timestamp, address, hostname, bytes_sent, bytes_received, upload_speed, download_speed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.timestamp,
                    r.address,
                    r.hostname,
                    r.bytes_sent,
                    r.bytes_received,
                    r.upload_speed,
                    r.download_speed,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Connections closed within a time range, optionally involving `address`.
    pub fn query_connections(
        &self,
        from_timestamp: i64,
        to_timestamp: i64,
        address: Option<&str>,
    ) -> Result<Vec<ConnectionHistoryRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT closed_at, protocol, initiator, initiator_port, responder, responder_port, first_seen, last_seen, packets, bytes
             FROM connection_history
             WHERE closed_at >= ?1 AND closed_at <= ?2
               AND (?3 IS NULL OR initiator = ?3 OR responder = ?3)
             ORDER BY closed_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![from_timestamp, to_timestamp, address], |row| {
            Ok(ConnectionHistoryRecord {
                closed_at: row.get(0)?,
                protocol: row.get(1)?,
                initiator: row.get(2)?,
                initiator_port: row.get(3)?,
                responder: row.get(4)?,
                responder_port: row.get(5)?,
                first_seen: row.get(6)?,
                last_seen: row.get(7)?,
                packets: row.get(8)?,
                bytes: row.get(9)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Device samples within a time range, optionally for one address.
    pub fn query_device_history(
        &self,
        from_timestamp: i64,
        to_timestamp: i64,
        address: Option<&str>,
    ) -> Result<Vec<DeviceTrafficRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, address, hostname, bytes_sent, bytes_received, upload_speed, download_speed
             FROM device_traffic
             WHERE timestamp >= ?1 AND timestamp <= ?2
               AND (?3 IS NULL OR address = ?3)
             ORDER BY timestamp ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![from_timestamp, to_timestamp, address], map_device_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Devices ranked by traffic moved within the window.
    ///
    /// Samples hold cumulative counters, so a device's traffic in the window
    /// is the spread between its first and last sample.
    pub fn top_devices(
        &self,
        from_timestamp: i64,
        to_timestamp: i64,
        limit: usize,
    ) -> Result<Vec<DeviceTrafficSummary>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT address, MAX(hostname),
                    MAX(bytes_sent) - MIN(bytes_sent) AS total_sent,
                    MAX(bytes_received) - MIN(bytes_received) AS total_received
             FROM device_traffic
             WHERE timestamp >= ?1 AND timestamp <= ?2
             GROUP BY address
             ORDER BY (total_sent + total_received) DESC, address ASC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![from_timestamp, to_timestamp, limit as i64], |row| {
            let total_sent: u64 = row.get(2)?;
            let total_received: u64 = row.get(3)?;
            Ok(DeviceTrafficSummary {
                address: row.get(0)?,
                hostname: row.get(1)?,
                total_sent,
                total_received,
                total_bytes: total_sent + total_received,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Prune rows older than the specified number of days from both tables.
    pub fn prune_old_records(&self, max_age_days: u64) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - (max_age_days * 86400) as i64;
        let conn = self.conn();
        let devices = conn.execute("DELETE FROM device_traffic WHERE timestamp < ?1", params![cutoff])?;
        let connections = conn.execute(
            "DELETE FROM connection_history WHERE closed_at < ?1",
            params![cutoff],
        )?;
        let deleted = devices + connections;
        if deleted > 0 {
            tracing::info!("Pruned {deleted} history records older than {max_age_days} days");
        }
        Ok(deleted)
    }
}

fn map_device_row(row: &rusqlite::Row) -> rusqlite::Result<DeviceTrafficRecord> {
    Ok(DeviceTrafficRecord {
        timestamp: row.get(0)?,
        address: row.get(1)?,
        hostname: row.get(2)?,
        bytes_sent: row.get(3)?,
        bytes_received: row.get(4)?,
        upload_speed: row.get(5)?,
        download_speed: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{make_device, open_memory_db};
    use super::*;
    use crate::capture::{FlowEvent, Protocol};
    use crate::config::TalkerWindow;
    use crate::core::{DeviceTable, FlowAggregator, StateGate};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn make_connection(closed_at: i64, initiator: &str, responder: &str, bytes: u64) -> ConnectionHistoryRecord {
        ConnectionHistoryRecord {
            closed_at,
            protocol: "TCP".into(),
            initiator: initiator.into(),
            initiator_port: 50000,
            responder: responder.into(),
            responder_port: 443,
            first_seen: closed_at - 300,
            last_seen: closed_at - 130,
            packets: bytes / 100,
            bytes,
        }
    }

    #[test]
    fn test_insert_and_query_connections() {
        let db = open_memory_db();
        db.insert_connections(&[
            make_connection(1000, "10.0.0.1", "10.0.0.9", 1500),
            make_connection(1010, "10.0.0.2", "10.0.0.1", 700),
            make_connection(1020, "10.0.0.3", "10.0.0.4", 100),
        ])
        .unwrap();

        let all = db.query_connections(0, 2000, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].bytes, 1500);

        // Matches the address on either side.
        let involving = db.query_connections(0, 2000, Some("10.0.0.1")).unwrap();
        assert_eq!(involving.len(), 2);

        let windowed = db.query_connections(1005, 1015, None).unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].initiator, "10.0.0.2");
    }

    #[test]
    fn test_evicted_connection_roundtrip() {
        let gate = Arc::new(StateGate::new());
        let agg = FlowAggregator::new(
            Arc::new(DeviceTable::new(TalkerWindow::AllTime)),
            gate,
            chrono::Duration::seconds(60),
        );
        let old = Utc::now() - chrono::Duration::seconds(600);
        agg.apply(&FlowEvent {
            timestamp: old,
            src: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            dst: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            src_port: 53000,
            dst_port: 53,
            protocol: Protocol::Udp,
            length: 80,
        });
        let now = Utc::now();
        let evicted: Vec<ConnectionHistoryRecord> = agg
            .sweep(now)
            .iter()
            .map(|c| ConnectionHistoryRecord::from_closed(c, now))
            .collect();

        let db = open_memory_db();
        db.insert_connections(&evicted).unwrap();
        let stored = db.query_connections(0, now.timestamp(), Some("192.168.1.10")).unwrap();
        assert_eq!(stored, evicted);
        assert_eq!(stored[0].protocol, "UDP");
        assert_eq!(stored[0].responder_port, 53);
    }

    #[test]
    fn test_query_device_history_with_filter() {
        let db = open_memory_db();
        db.insert_device_batch(&[
            make_device(1000, "10.0.0.1", 100, 200),
            make_device(1000, "10.0.0.2", 300, 400),
            make_device(1005, "10.0.0.1", 150, 250),
        ])
        .unwrap();

        let one = db.query_device_history(0, 2000, Some("10.0.0.1")).unwrap();
        assert_eq!(one.len(), 2);
        assert!(one.iter().all(|r| r.address == "10.0.0.1"));
        assert_eq!(one[1].bytes_sent, 150);

        assert!(db.query_device_history(0, 2000, Some("10.0.0.99")).unwrap().is_empty());
        assert_eq!(db.query_device_history(0, 2000, None).unwrap().len(), 3);
    }

    #[test]
    fn test_top_devices_uses_counter_spread() {
        let db = open_memory_db();
        db.insert_device_batch(&[
            // .1 moves 100 + 200 = 300 within the window
            make_device(1000, "10.0.0.1", 1000, 2000),
            make_device(1005, "10.0.0.1", 1100, 2200),
            // .2 moves 500 + 500 = 1000
            make_device(1000, "10.0.0.2", 0, 0),
            make_device(1005, "10.0.0.2", 500, 500),
            // .3 has a single sample and moves nothing
            make_device(1000, "10.0.0.3", 9000, 9000),
        ])
        .unwrap();

        let top = db.top_devices(0, 2000, 10).unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].address, "10.0.0.2");
        assert_eq!(top[0].total_bytes, 1000);
        assert_eq!(top[1].address, "10.0.0.1");
        assert_eq!(top[1].total_sent, 100);
        assert_eq!(top[1].total_received, 200);
        assert_eq!(top[2].total_bytes, 0);

        let top1 = db.top_devices(0, 2000, 1).unwrap();
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].address, "10.0.0.2");
    }

    #[test]
    fn test_prune_old_records() {
        let db = open_memory_db();
        let now = Utc::now().timestamp();
        let old_ts = now - 100 * 86400;
        let recent_ts = now - 86400;

        db.insert_device_batch(&[
            make_device(old_ts, "10.0.0.1", 1, 1),
            make_device(recent_ts, "10.0.0.2", 1, 1),
        ])
        .unwrap();
        db.insert_connections(&[
            make_connection(old_ts, "10.0.0.1", "10.0.0.2", 100),
            make_connection(recent_ts, "10.0.0.1", "10.0.0.2", 100),
        ])
        .unwrap();

        assert_eq!(db.prune_old_records(90).unwrap(), 2);
        let remaining = db.query_device_history(0, now + 1000, None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address, "10.0.0.2");
        assert_eq!(db.query_connections(0, now + 1000, None).unwrap().len(), 1);
    }
}
