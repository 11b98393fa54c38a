//! Per-device traffic accounting using DashMap for lock-free concurrent access.
//!
//! Keyed by network address. Traffic counters are written by the aggregation
//! workers, scan attributes by the registry, speeds by the bandwidth tick.
//! Records are never removed, so a device's byte counters only ever grow.
//!
//! None of these methods take the [`StateGate`](super::gate::StateGate); the
//! aggregator and registry hold it around each call.

use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::flow::ConnectionRecord;
use crate::capture::FlowEvent;
use crate::collectors::ScanResult;
use crate::config::TalkerWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Active,
    Inactive,
}

/// Running state for a single device.
#[derive(Debug)]
pub struct DeviceRecord {
    pub address: IpAddr,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub open_ports: Vec<u16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_traffic: Option<DateTime<Utc>>,
    pub last_scanned: Option<DateTime<Utc>>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Totals of evicted connections this device initiated.
    pub historical_bytes: u64,
    pub historical_packets: u64,
    pub closed_connections: u64,
    pub active_connections: u32,
    pub status: DeviceStatus,
    pub upload_speed: f64,
    pub download_speed: f64,
    prev_sent: u64,
    prev_recv: u64,
    last_tick: Option<Instant>,
    /// (unix second, bytes) buckets, only kept for a recent talker window.
    recent: VecDeque<(i64, u64)>,
}

impl DeviceRecord {
    fn new(address: IpAddr, at: DateTime<Utc>) -> Self {
        Self {
            address,
            hostname: None,
            mac: None,
            open_ports: Vec::new(),
            first_seen: at,
            last_seen: at,
            last_traffic: None,
            last_scanned: None,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            historical_bytes: 0,
            historical_packets: 0,
            closed_connections: 0,
            active_connections: 0,
            status: DeviceStatus::Active,
            upload_speed: 0.0,
            download_speed: 0.0,
            prev_sent: 0,
            prev_recv: 0,
            last_tick: None,
            recent: VecDeque::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }

    fn observe(&mut self, at: DateTime<Utc>) {
        self.first_seen = self.first_seen.min(at);
        self.last_seen = self.last_seen.max(at);
        self.status = DeviceStatus::Active;
    }

    fn observe_traffic(&mut self, at: DateTime<Utc>, bytes: u64, span: Option<i64>) {
        self.observe(at);
        self.last_traffic = Some(self.last_traffic.map_or(at, |t| t.max(at)));

        if let Some(span) = span {
            let second = at.timestamp();
            match self.recent.back_mut() {
                Some((bucket, total)) if *bucket == second => *total += bytes,
                _ => self.recent.push_back((second, bytes)),
            }
            let newest = self.recent.back().map_or(second, |(s, _)| *s);
            while self.recent.front().is_some_and(|(s, _)| *s <= newest - span) {
                self.recent.pop_front();
            }
        }
    }

    /// Bytes in buckets newer than `now - secs`.
    fn recent_bytes(&self, now: DateTime<Utc>, secs: u64) -> u64 {
        let cutoff = now.timestamp() - secs as i64;
        self.recent
            .iter()
            .filter(|(second, _)| *second > cutoff)
            .map(|(_, bytes)| bytes)
            .sum()
    }
}

/// Serializable view of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub address: IpAddr,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub open_ports: Vec<u16>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub historical_bytes: u64,
    pub historical_packets: u64,
    pub closed_connections: u64,
    pub active_connections: u32,
    pub status: DeviceStatus,
    /// Upload speed in bytes/sec.
    pub upload_speed: f64,
    /// Download speed in bytes/sec.
    pub download_speed: f64,
}

impl DeviceSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

impl From<&DeviceRecord> for DeviceSnapshot {
    fn from(d: &DeviceRecord) -> Self {
        Self {
            address: d.address,
            hostname: d.hostname.clone(),
            mac: d.mac.clone(),
            open_ports: d.open_ports.clone(),
            first_seen: d.first_seen,
            last_seen: d.last_seen,
            bytes_sent: d.bytes_sent,
            bytes_received: d.bytes_received,
            packets_sent: d.packets_sent,
            packets_received: d.packets_received,
            historical_bytes: d.historical_bytes,
            historical_packets: d.historical_packets,
            closed_connections: d.closed_connections,
            active_connections: d.active_connections,
            status: d.status,
            upload_speed: d.upload_speed,
            download_speed: d.download_speed,
        }
    }
}

/// One entry of the top-talkers ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Talker {
    pub address: IpAddr,
    pub hostname: Option<String>,
    /// Volume the ranking is based on (all-time total or recent window).
    pub bytes: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Sort descending by volume, ties by address ascending, and keep the first `n`.
pub fn rank_talkers(mut talkers: Vec<Talker>, n: usize) -> Vec<Talker> {
    talkers.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.address.cmp(&b.address)));
    talkers.truncate(n);
    talkers
}

/// Thread-safe device table. Keyed by address.
pub struct DeviceTable {
    devices: DashMap<IpAddr, DeviceRecord>,
    /// Bucket span in seconds when a recent talker window is configured.
    recent_span: Option<i64>,
}

impl DeviceTable {
    pub fn new(window: TalkerWindow) -> Self {
        let recent_span = match window {
            TalkerWindow::AllTime => None,
            TalkerWindow::Recent { secs } => Some(secs as i64),
        };
        Self {
            devices: DashMap::new(),
            recent_span,
        }
    }

    /// Account one flow event to both endpoints. `opened` is set when the
    /// event created a new connection.
    pub fn record_traffic(&self, event: &FlowEvent, opened: bool) {
        let at = event.timestamp;
        {
            let mut src = self
                .devices
                .entry(event.src)
                .or_insert_with(|| DeviceRecord::new(event.src, at));
            src.bytes_sent += event.length;
            src.packets_sent += 1;
            if opened {
                src.active_connections += 1;
            }
            src.observe_traffic(at, event.length, self.recent_span);
        }

        let mut dst = self
            .devices
            .entry(event.dst)
            .or_insert_with(|| DeviceRecord::new(event.dst, at));
        dst.bytes_received += event.length;
        dst.packets_received += 1;
        if opened && event.dst != event.src {
            dst.active_connections += 1;
        }
        // Self-addressed traffic was already bucketed on the sender side.
        let bucket_bytes = if event.dst == event.src { 0 } else { event.length };
        dst.observe_traffic(at, bucket_bytes, self.recent_span);
    }

    /// Fold an evicted connection into its initiator's history and release
    /// the active-connection slot on both endpoints.
    pub fn roll_up(&self, conn: &ConnectionRecord) {
        let initiator = conn.initiator.address;
        let responder = conn.responder.address;

        if let Some(mut d) = self.devices.get_mut(&initiator) {
            d.historical_bytes += conn.bytes;
            d.historical_packets += conn.packets;
            d.closed_connections += 1;
            d.active_connections = d.active_connections.saturating_sub(1);
        }
        if responder != initiator {
            if let Some(mut d) = self.devices.get_mut(&responder) {
                d.active_connections = d.active_connections.saturating_sub(1);
            }
        }
    }

    /// Merge one scan sighting. Traffic counters are left untouched.
    /// Returns `true` if the device was not known before.
    pub fn merge_scan(&self, result: &ScanResult, at: DateTime<Utc>) -> bool {
        let mut created = false;
        let mut d = self.devices.entry(result.address).or_insert_with(|| {
            created = true;
            DeviceRecord::new(result.address, at)
        });
        if result.hostname.is_some() {
            d.hostname = result.hostname.clone();
        }
        if result.mac.is_some() {
            d.mac = result.mac.clone();
        }
        // Host-discovery scans report no ports; keep what an earlier port scan found.
        if !result.open_ports.is_empty() {
            d.open_ports = result.open_ports.clone();
        }
        d.last_scanned = Some(at);
        d.observe(at);
        created
    }

    /// Mark devices inactive that are not in `seen` and have not been seen for
    /// longer than `grace`. Returns how many changed status.
    pub fn expire(&self, seen: &HashSet<IpAddr>, grace: chrono::Duration, now: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for mut entry in self.devices.iter_mut() {
            let d = entry.value_mut();
            if d.status == DeviceStatus::Active && !seen.contains(&d.address) && now - d.last_seen > grace {
                d.status = DeviceStatus::Inactive;
                changed += 1;
            }
        }
        changed
    }

    /// Recalculate speeds for all devices.
    pub fn tick_speeds(&self, now: Instant) {
        for mut entry in self.devices.iter_mut() {
            let d = entry.value_mut();
            if let Some(last) = d.last_tick {
                let elapsed = now.duration_since(last).as_secs_f64();
                if elapsed > 0.0 {
                    d.upload_speed = (d.bytes_sent.saturating_sub(d.prev_sent)) as f64 / elapsed;
                    d.download_speed =
                        (d.bytes_received.saturating_sub(d.prev_recv)) as f64 / elapsed;
                }
            }
            d.prev_sent = d.bytes_sent;
            d.prev_recv = d.bytes_received;
            d.last_tick = Some(now);
        }
    }

    pub fn get(&self, address: &IpAddr) -> Option<DeviceSnapshot> {
        self.devices.get(address).map(|d| DeviceSnapshot::from(d.value()))
    }

    /// All devices, ordered by address.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<DeviceSnapshot> = self
            .devices
            .iter()
            .map(|entry| DeviceSnapshot::from(entry.value()))
            .collect();
        devices.sort_by_key(|d| d.address);
        devices
    }

    /// Unranked talker volumes for the given window.
    pub fn talkers(&self, window: TalkerWindow, now: DateTime<Utc>) -> Vec<Talker> {
        self.devices
            .iter()
            .map(|entry| {
                let d = entry.value();
                let bytes = match window {
                    TalkerWindow::AllTime => d.total_bytes(),
                    TalkerWindow::Recent { secs } => d.recent_bytes(now, secs),
                };
                Talker {
                    address: d.address,
                    hostname: d.hostname.clone(),
                    bytes,
                    bytes_sent: d.bytes_sent,
                    bytes_received: d.bytes_received,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
