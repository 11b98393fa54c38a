//! Device registry: merges scanner sightings into the shared device table.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::device::DeviceTable;
use super::gate::StateGate;
use super::stats::PipelineStats;
use crate::collectors::{NetworkScanner, ScanResult};
use crate::error::Error;

/// Outcome of the latest successful scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub at: DateTime<Utc>,
    pub hosts: usize,
    pub discovered: usize,
    pub marked_inactive: usize,
}

pub struct DeviceRegistry {
    devices: Arc<DeviceTable>,
    gate: Arc<StateGate>,
    grace: chrono::Duration,
    last_scan: Mutex<Option<ScanReport>>,
}

impl DeviceRegistry {
    pub fn new(devices: Arc<DeviceTable>, gate: Arc<StateGate>, grace: chrono::Duration) -> Self {
        Self {
            devices,
            gate,
            grace,
            last_scan: Mutex::new(None),
        }
    }

    /// Merge one complete scan and expire devices missing from it.
    pub fn apply_scan(&self, results: &[ScanResult], now: DateTime<Utc>) -> ScanReport {
        let report = {
            let _guard = self.gate.update();
            let mut discovered = 0;
            for result in results {
                if self.devices.merge_scan(result, now) {
                    discovered += 1;
                }
            }
            let seen: HashSet<IpAddr> = results.iter().map(|r| r.address).collect();
            let marked_inactive = self.devices.expire(&seen, self.grace, now);
            ScanReport {
                at: now,
                hosts: results.len(),
                discovered,
                marked_inactive,
            }
        };

        *self.last_scan.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    /// Run one scan with a timeout. On any fault the table is left as it was,
    /// the fault is counted, and `None` is returned.
    pub async fn rescan(
        &self,
        scanner: &dyn NetworkScanner,
        range: &str,
        timeout: Duration,
        stats: &PipelineStats,
    ) -> Option<ScanReport> {
        let outcome = match tokio::time::timeout(timeout, scanner.scan(range)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Scan(format!("scan of {range} timed out after {timeout:?}"))),
        };

        match outcome {
            Ok(results) => {
                let report = self.apply_scan(&results, Utc::now());
                tracing::info!(
                    "Scan of {range}: {} hosts up, {} new, {} marked inactive",
                    report.hosts,
                    report.discovered,
                    report.marked_inactive
                );
                Some(report)
            }
            Err(e) => {
                stats.record_scan_fault(&e, Utc::now());
                tracing::warn!("Scan fault, keeping last-known devices: {e}");
                None
            }
        }
    }

    /// Turn cumulative byte counters into per-device speeds.
    pub fn tick_speeds(&self, now: Instant) {
        let _guard = self.gate.update();
        self.devices.tick_speeds(now);
    }

    pub fn last_scan(&self) -> Option<ScanReport> {
        self.last_scan.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }
}
