//! Pipeline health counters, shared by every stage and reported in snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, FaultRecord};

#[derive(Debug, Default)]
pub struct PipelineStats {
    packets_seen: AtomicU64,
    flow_events: AtomicU64,
    parse_errors: AtomicU64,
    queue_overflows: AtomicU64,
    capture_faults: AtomicU64,
    scan_faults: AtomicU64,
    probe_timeouts: AtomicU64,
    probe_failures: AtomicU64,
    evicted_connections: AtomicU64,
    last_fault: Mutex<Option<FaultRecord>>,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineCounters {
    pub packets_seen: u64,
    pub flow_events: u64,
    pub parse_errors: u64,
    pub queue_overflows: u64,
    pub capture_faults: u64,
    pub scan_faults: u64,
    pub probe_timeouts: u64,
    pub probe_failures: u64,
    pub evicted_connections: u64,
    pub last_fault: Option<FaultRecord>,
}

impl PipelineStats {
    pub fn record_packet(&self) {
        self.packets_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_event(&self) {
        self.flow_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_fault(&self, err: &Error, at: DateTime<Utc>) {
        self.capture_faults.fetch_add(1, Ordering::Relaxed);
        self.set_last_fault(err, at);
    }

    pub fn record_scan_fault(&self, err: &Error, at: DateTime<Utc>) {
        self.scan_faults.fetch_add(1, Ordering::Relaxed);
        self.set_last_fault(err, at);
    }

    pub fn record_probe_timeout(&self) {
        self.probe_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self, err: &Error, at: DateTime<Utc>) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
        self.set_last_fault(err, at);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evicted_connections.fetch_add(count, Ordering::Relaxed);
    }

    fn set_last_fault(&self, err: &Error, at: DateTime<Utc>) {
        let mut slot = self.last_fault.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(FaultRecord::new(err, at));
    }

    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            packets_seen: self.packets_seen.load(Ordering::Relaxed),
            flow_events: self.flow_events.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            capture_faults: self.capture_faults.load(Ordering::Relaxed),
            scan_faults: self.scan_faults.load(Ordering::Relaxed),
            probe_timeouts: self.probe_timeouts.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            evicted_connections: self.evicted_connections.load(Ordering::Relaxed),
            last_fault: self
                .last_fault
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
