//! Connection tracking: folds flow events into bidirectional connection
//! records and device counters, and evicts idle connections losslessly.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::device::{rank_talkers, DeviceTable, Talker};
use super::gate::StateGate;
use crate::capture::{FlowEvent, Protocol};
use crate::config::TalkerWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Endpoint {
    pub address: IpAddr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(v4) => write!(f, "{v4}:{}", self.port),
            IpAddr::V6(v6) => write!(f, "[{v6}]:{}", self.port),
        }
    }
}

/// Canonical connection key: the lower endpoint always comes first, so both
/// directions of one exchange produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    pub protocol: Protocol,
    pub lower: Endpoint,
    pub upper: Endpoint,
}

impl ConnectionKey {
    pub fn from_event(event: &FlowEvent) -> Self {
        let src = Endpoint {
            address: event.src,
            port: event.src_port,
        };
        let dst = Endpoint {
            address: event.dst,
            port: event.dst_port,
        };
        let (lower, upper) = if src <= dst { (src, dst) } else { (dst, src) };
        Self {
            protocol: event.protocol,
            lower,
            upper,
        }
    }

    pub fn involves(&self, address: IpAddr) -> bool {
        self.lower.address == address || self.upper.address == address
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} <-> {}", self.protocol, self.lower, self.upper)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionRecord {
    pub key: ConnectionKey,
    /// Sender of the first observed packet.
    pub initiator: Endpoint,
    pub responder: Endpoint,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packets: u64,
    pub bytes: u64,
    pub state: ConnectionState,
}

impl ConnectionRecord {
    fn open(key: ConnectionKey, event: &FlowEvent) -> Self {
        Self {
            key,
            initiator: Endpoint {
                address: event.src,
                port: event.src_port,
            },
            responder: Endpoint {
                address: event.dst,
                port: event.dst_port,
            },
            first_seen: event.timestamp,
            last_seen: event.timestamp,
            packets: 1,
            bytes: event.length,
            state: ConnectionState::Open,
        }
    }

    fn observe(&mut self, event: &FlowEvent) {
        self.packets += 1;
        self.bytes += event.length;
        self.first_seen = self.first_seen.min(event.timestamp);
        self.last_seen = self.last_seen.max(event.timestamp);
    }

    pub fn duration(&self) -> chrono::Duration {
        self.last_seen - self.first_seen
    }
}

pub struct FlowAggregator {
    connections: DashMap<ConnectionKey, ConnectionRecord>,
    protocols: DashMap<Protocol, u64>,
    devices: Arc<DeviceTable>,
    gate: Arc<StateGate>,
    inactivity_timeout: chrono::Duration,
    applied: AtomicU64,
}

impl FlowAggregator {
    pub fn new(devices: Arc<DeviceTable>, gate: Arc<StateGate>, inactivity_timeout: chrono::Duration) -> Self {
        Self {
            connections: DashMap::new(),
            protocols: DashMap::new(),
            devices,
            gate,
            inactivity_timeout,
            applied: AtomicU64::new(0),
        }
    }

    /// Fold one event into its connection, both endpoint devices, and the
    /// protocol tally, as a single logical update.
    pub fn apply(&self, event: &FlowEvent) {
        let _guard = self.gate.update();
        let key = ConnectionKey::from_event(event);

        // Devices are updated while the connection's shard is still held, so a
        // concurrent sweep cannot evict the record before its open is counted.
        // Lock order is always connection shard, then device shard.
        match self.connections.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().observe(event);
                self.devices.record_traffic(event, false);
            }
            Entry::Vacant(entry) => {
                let _record = entry.insert(ConnectionRecord::open(key, event));
                self.devices.record_traffic(event, true);
            }
        }

        *self.protocols.entry(event.protocol).or_insert(0) += 1;
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Evict connections idle for longer than the inactivity timeout, rolling
    /// their totals into the initiator device. Returns the closed records.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ConnectionRecord> {
        let _guard = self.gate.update();
        let timeout = self.inactivity_timeout;
        let mut evicted = Vec::new();

        self.connections.retain(|_, conn| {
            if now - conn.last_seen > timeout {
                let mut closed = conn.clone();
                closed.state = ConnectionState::Closed;
                evicted.push(closed);
                false
            } else {
                true
            }
        });

        for conn in &evicted {
            self.devices.roll_up(conn);
        }

        if !evicted.is_empty() {
            tracing::debug!("Evicted {} idle connections", evicted.len());
        }
        evicted
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<ConnectionRecord> {
        self.connections.get(key).map(|c| c.value().clone())
    }

    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// The `limit` most recently active connections, newest first.
    pub fn recent_connections(&self, limit: usize) -> Vec<ConnectionRecord> {
        let mut all = self.connections();
        sort_recent_first(&mut all);
        all.truncate(limit);
        all
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn protocol_distribution(&self) -> BTreeMap<Protocol, u64> {
        self.protocols.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub fn top_talkers(&self, n: usize, window: TalkerWindow, now: DateTime<Utc>) -> Vec<Talker> {
        rank_talkers(self.devices.talkers(window, now), n)
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    /// Number of events applied since start.
    pub fn total_packets(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

/// Newest activity first; ties in a stable key order.
pub fn sort_recent_first(connections: &mut [ConnectionRecord]) {
    connections.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.key.lower.cmp(&b.key.lower))
            .then_with(|| a.key.upper.cmp(&b.key.upper))
            .then_with(|| a.key.protocol.cmp(&b.key.protocol))
    });
}
