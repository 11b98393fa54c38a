//! Core logic: flow aggregation, device accounting, metrics, snapshots.
//!
//! - [`FlowAggregator`] — bidirectional connection records, sweep and roll-up
//! - [`DeviceTable`] — per-device byte counters with speed calculation
//! - [`DeviceRegistry`] — scan merge and inactivity tracking
//! - [`MetricsEngine`] — latency, jitter, loss, DNS and connect timings
//! - [`SnapshotPublisher`] — consistent immutable snapshots
//! - [`StateGate`] — update/freeze discipline shared by all of the above

pub mod device;
pub mod flow;
pub mod gate;
pub mod metrics;
pub mod registry;
pub mod snapshot;
pub mod stats;

pub use device::{DeviceSnapshot, DeviceStatus, DeviceTable, Talker};
pub use flow::{ConnectionKey, ConnectionRecord, ConnectionState, FlowAggregator};
pub use gate::StateGate;
pub use metrics::{MetricKind, MetricSample, MetricsEngine, ProbeOutcome, ProbeResult};
pub use registry::{DeviceRegistry, ScanReport};
pub use snapshot::{Snapshot, SnapshotOptions, SnapshotPublisher};
pub use stats::{PipelineCounters, PipelineStats};
