//! Periodic, immutable snapshots of the aggregated state.
//!
//! [`SnapshotPublisher::publish`] copies the flow, device and metric state
//! under the frozen [`StateGate`](super::gate::StateGate), then ranks and
//! sorts outside it and swaps the result in atomically. Readers get an
//! `Arc<Snapshot>` that never changes underneath them.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::device::{rank_talkers, DeviceSnapshot, Talker};
use super::flow::{sort_recent_first, ConnectionRecord, FlowAggregator};
use super::gate::StateGate;
use super::metrics::{MetricSample, MetricsEngine, TargetSummary};
use super::registry::{DeviceRegistry, ScanReport};
use super::stats::{PipelineCounters, PipelineStats};
use crate::capture::Protocol;
use crate::config::{Settings, TalkerWindow};

/// Connections listed in [`Snapshot::device_details`].
pub const DEVICE_DETAIL_CONNECTIONS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub talker_window: TalkerWindow,
    pub top_talkers: Vec<Talker>,
    pub protocol_distribution: BTreeMap<Protocol, u64>,
    pub devices: Vec<DeviceSnapshot>,
    pub active_connections: usize,
    /// Most recently active connections, newest first.
    pub connections: Vec<ConnectionRecord>,
    pub metrics: Vec<TargetSummary>,
    pub recent_samples: Vec<MetricSample>,
    pub pipeline: PipelineCounters,
    pub last_scan: Option<ScanReport>,
}

/// A device together with its live connections.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceDetails {
    pub device: DeviceSnapshot,
    pub connections: Vec<ConnectionRecord>,
    pub upload_speed: f64,
    pub download_speed: f64,
}

impl Snapshot {
    /// The snapshot served before the first publish.
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            talker_window: TalkerWindow::default(),
            top_talkers: Vec::new(),
            protocol_distribution: BTreeMap::new(),
            devices: Vec::new(),
            active_connections: 0,
            connections: Vec::new(),
            metrics: Vec::new(),
            recent_samples: Vec::new(),
            pipeline: PipelineCounters::default(),
            last_scan: None,
        }
    }

    pub fn device(&self, address: &IpAddr) -> Option<&DeviceSnapshot> {
        self.devices
            .binary_search_by(|d| d.address.cmp(address))
            .ok()
            .map(|i| &self.devices[i])
    }

    pub fn device_details(&self, address: &IpAddr) -> Option<DeviceDetails> {
        let device = self.device(address)?.clone();
        let connections = self
            .connections
            .iter()
            .filter(|c| c.key.involves(*address))
            .take(DEVICE_DETAIL_CONNECTIONS)
            .cloned()
            .collect();
        Some(DeviceDetails {
            upload_speed: device.upload_speed,
            download_speed: device.download_speed,
            device,
            connections,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotOptions {
    pub top_talkers: usize,
    pub talker_window: TalkerWindow,
    pub connection_limit: usize,
    pub recent_samples: usize,
}

impl From<&Settings> for SnapshotOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            top_talkers: settings.top_talkers,
            talker_window: settings.talker_window,
            connection_limit: settings.connection_limit,
            recent_samples: settings.recent_samples,
        }
    }
}

pub struct SnapshotPublisher {
    flows: Arc<FlowAggregator>,
    metrics: Arc<MetricsEngine>,
    registry: Arc<DeviceRegistry>,
    stats: Arc<PipelineStats>,
    gate: Arc<StateGate>,
    options: SnapshotOptions,
    latest: ArcSwap<Snapshot>,
    sequence: AtomicU64,
}

impl SnapshotPublisher {
    pub fn new(
        flows: Arc<FlowAggregator>,
        metrics: Arc<MetricsEngine>,
        registry: Arc<DeviceRegistry>,
        stats: Arc<PipelineStats>,
        gate: Arc<StateGate>,
        options: SnapshotOptions,
    ) -> Self {
        Self {
            flows,
            metrics,
            registry,
            stats,
            gate,
            options,
            latest: ArcSwap::from_pointee(Snapshot::empty()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Assemble and publish one snapshot.
    pub fn publish(&self, now: DateTime<Utc>) -> Arc<Snapshot> {
        let frozen = self.gate.freeze();
        let talkers = self.flows.devices().talkers(self.options.talker_window, now);
        let devices = self.flows.devices().snapshot();
        let mut connections = self.flows.connections();
        let protocol_distribution = self.flows.protocol_distribution();
        let metrics = self.metrics.summaries();
        let recent_samples = self.metrics.recent_samples(self.options.recent_samples);
        let pipeline = self.stats.counters();
        let last_scan = self.registry.last_scan();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        drop(frozen);

        let active_connections = connections.len();
        sort_recent_first(&mut connections);
        connections.truncate(self.options.connection_limit);

        let snapshot = Arc::new(Snapshot {
            sequence,
            timestamp: now,
            talker_window: self.options.talker_window,
            top_talkers: rank_talkers(talkers, self.options.top_talkers),
            protocol_distribution,
            devices,
            active_connections,
            connections,
            metrics,
            recent_samples,
            pipeline,
            last_scan,
        });

        // Publish order follows sequence order even if two publishes race.
        self.latest.rcu(|current| {
            if current.sequence > sequence {
                Arc::clone(current)
            } else {
                Arc::clone(&snapshot)
            }
        });
        snapshot
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.latest.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FlowEvent;
    use crate::core::device::DeviceTable;
    use crate::core::metrics::{MetricKind, MetricsConfig, ProbeOutcome, ProbeResult};
    use crate::error::Error;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct Harness {
        flows: Arc<FlowAggregator>,
        metrics: Arc<MetricsEngine>,
        stats: Arc<PipelineStats>,
        publisher: SnapshotPublisher,
    }

    fn harness(options: SnapshotOptions) -> Harness {
        let gate = Arc::new(StateGate::new());
        let devices = Arc::new(DeviceTable::new(options.talker_window));
        let flows = Arc::new(FlowAggregator::new(
            Arc::clone(&devices),
            Arc::clone(&gate),
            chrono::Duration::seconds(120),
        ));
        let metrics = Arc::new(MetricsEngine::new(
            Arc::clone(&gate),
            MetricsConfig {
                ring_capacity: 100,
                jitter_window: 10,
                loss_window: 20,
            },
        ));
        let registry = Arc::new(DeviceRegistry::new(
            devices,
            Arc::clone(&gate),
            chrono::Duration::seconds(600),
        ));
        let stats = Arc::new(PipelineStats::default());
        let publisher = SnapshotPublisher::new(
            Arc::clone(&flows),
            Arc::clone(&metrics),
            registry,
            Arc::clone(&stats),
            gate,
            options,
        );
        Harness {
            flows,
            metrics,
            stats,
            publisher,
        }
    }

    fn options() -> SnapshotOptions {
        SnapshotOptions {
            top_talkers: 5,
            talker_window: TalkerWindow::AllTime,
            connection_limit: 50,
            recent_samples: 10,
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 1, 0, last))
    }

    fn event(src: u8, dst: u8, sport: u16, length: u64) -> FlowEvent {
        FlowEvent {
            timestamp: Utc::now(),
            src: ip(src),
            dst: ip(dst),
            src_port: sport,
            dst_port: 443,
            protocol: Protocol::Tcp,
            length,
        }
    }

    #[test]
    fn test_latest_before_publish_is_empty() {
        let h = harness(options());
        let s = h.publisher.latest();
        assert_eq!(s.sequence, 0);
        assert!(s.devices.is_empty());
    }

    #[test]
    fn test_publish_collects_all_components() {
        let h = harness(options());
        for _ in 0..100 {
            h.flows.apply(&event(1, 2, 40000, 50));
        }
        h.metrics.record(ProbeResult {
            target: "8.8.8.8".into(),
            at: Utc::now(),
            outcome: ProbeOutcome::EchoReply(Duration::from_millis(12)),
        });

        let s = h.publisher.publish(Utc::now());
        assert_eq!(s.sequence, 1);
        assert_eq!(s.devices.len(), 2);
        assert_eq!(s.connections.len(), 1);
        assert_eq!(s.connections[0].bytes, 5000);
        assert_eq!(s.protocol_distribution.get(&Protocol::Tcp), Some(&100));
        assert_eq!(s.top_talkers[0].bytes, 5000);
        assert!(s.metrics[0].summaries.contains_key(&MetricKind::Latency));
        assert!(!s.recent_samples.is_empty());
        assert!(s.device(&ip(1)).unwrap().bytes_sent >= 5000);
        assert_eq!(h.publisher.latest().sequence, 1);
    }

    #[test]
    fn test_connection_limit_and_device_details() {
        let mut opts = options();
        opts.connection_limit = 3;
        let h = harness(opts);
        for port in 0..6u16 {
            h.flows.apply(&event(1, 2, 50000 + port, 10));
        }
        h.flows.apply(&event(3, 4, 1, 10));

        let s = h.publisher.publish(Utc::now());
        assert_eq!(s.active_connections, 7);
        assert_eq!(s.connections.len(), 3);

        let details = s.device_details(&ip(1)).unwrap();
        assert!(details.connections.len() <= DEVICE_DETAIL_CONNECTIONS);
        assert!(details.connections.iter().all(|c| c.key.involves(ip(1))));
        assert!(s.device_details(&ip(99)).is_none());
    }

    #[test]
    fn test_snapshot_serializes() {
        let h = harness(options());
        h.flows.apply(&event(1, 2, 1, 10));
        let json = serde_json::to_value(&*h.publisher.publish(Utc::now())).unwrap();
        assert_eq!(json["protocol_distribution"]["TCP"], 1);
        assert_eq!(json["talker_window"]["mode"], "all_time");
        assert!(json["pipeline"]["last_fault"].is_null());
    }

    #[test]
    fn test_publisher_keeps_emitting_through_capture_fault() {
        let h = harness(options());
        h.flows.apply(&event(1, 2, 1, 700));
        let before = h.publisher.publish(Utc::now());

        h.stats.record_capture_fault(&Error::Capture("device vanished".into()), Utc::now());
        let during = h.publisher.publish(Utc::now());

        assert_eq!(during.sequence, before.sequence + 1);
        assert_eq!(during.pipeline.capture_faults, before.pipeline.capture_faults + 1);
        assert_eq!(during.devices, before.devices);
        assert_eq!(during.pipeline.last_fault.as_ref().unwrap().kind, "Capture");
    }

    #[test]
    fn test_concurrent_snapshots_never_decrease_device_bytes() {
        let h = Arc::new(harness(options()));
        let writers: Vec<_> = (0..3u8)
            .map(|w| {
                let flows = Arc::clone(&h.flows);
                std::thread::spawn(move || {
                    for i in 0..400u16 {
                        flows.apply(&event(1, 20 + w, i % 11, 100));
                    }
                })
            })
            .collect();

        let mut last_sent = 0;
        let mut last_sequence = 0;
        for _ in 0..100 {
            let s = h.publisher.publish(Utc::now());
            assert!(s.sequence > last_sequence);
            last_sequence = s.sequence;
            let sent = s.device(&ip(1)).map_or(0, |d| d.bytes_sent);
            assert!(sent >= last_sent);
            last_sent = sent;
        }
        for w in writers {
            w.join().unwrap();
        }
        let s = h.publisher.publish(Utc::now());
        assert_eq!(s.device(&ip(1)).unwrap().bytes_sent, 3 * 400 * 100);
    }

    #[test]
    fn test_snapshot_consistent_across_eviction() {
        let h = harness(options());
        let old = Utc::now() - chrono::Duration::seconds(3600);
        h.flows.apply(&FlowEvent {
            timestamp: old,
            ..event(1, 2, 9, 4321)
        });
        let evicted = h.flows.sweep(Utc::now());
        assert_eq!(evicted.len(), 1);

        let s = h.publisher.publish(Utc::now());
        let device = s.device(&ip(1)).unwrap();
        assert!(s.connections.is_empty());
        assert_eq!(device.historical_bytes, 4321);
        assert_eq!(device.active_connections, 0);
    }
}
