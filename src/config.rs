//! Runtime settings for NetVision.
//!
//! Defaults live here as constants so they can be found and adjusted in one
//! place. [`Settings`] is the plain structure handed to the engine at startup;
//! it can be loaded from TOML and every field falls back to its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Network range handed to the scanner when none is configured.
pub const DEFAULT_NETWORK_RANGE: &str = "192.168.1.0/24";

/// Total capacity of the capture → aggregation queue (events, all lanes).
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Number of aggregation workers (and queue lanes).
pub const DEFAULT_AGGREGATION_WORKERS: usize = 2;

/// Connections idle longer than this are evicted (seconds).
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 120;

/// Interval of the connection eviction sweep (seconds).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;

/// Interval at which snapshots are published (seconds).
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 5;

/// Interval at which per-device speeds are recomputed (seconds).
pub const DEFAULT_BANDWIDTH_INTERVAL_SECS: u64 = 5;

/// Interval between probe rounds over all targets (seconds).
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 60;

/// Interval between network scans (seconds).
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 300;

/// A scan still running after this long is abandoned (seconds).
pub const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 120;

/// Devices unseen by scan and traffic for this long are marked inactive (seconds).
pub const DEFAULT_INACTIVE_GRACE_SECS: u64 = 600;

/// Samples kept per (target, metric kind).
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Latency samples that jitter is averaged over.
pub const DEFAULT_JITTER_WINDOW: usize = 10;

/// Echo probes that packet loss is computed over.
pub const DEFAULT_LOSS_WINDOW: usize = 20;

/// Echo probes sent to each target per round.
pub const DEFAULT_ECHO_COUNT: u32 = 4;

/// An echo probe unanswered after this long counts as lost (milliseconds).
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;

/// Upper bound on probes dispatched per second across all targets.
pub const DEFAULT_PROBES_PER_SECOND: u32 = 10;

/// TCP port used for connection-establishment timing.
pub const DEFAULT_CONNECT_PORT: u16 = 80;

/// Number of top talkers included in a snapshot.
pub const DEFAULT_TOP_TALKERS: usize = 5;

/// Number of most recently active connections included in a snapshot.
pub const DEFAULT_CONNECTION_LIMIT: usize = 50;

/// Samples per (target, kind) included in a snapshot.
pub const DEFAULT_RECENT_SAMPLES: usize = 10;

/// Interval at which device totals are written to the history store (seconds).
pub const DEFAULT_HISTORY_INTERVAL_SECS: u64 = 5;

/// History rows older than this are pruned (days).
pub const DEFAULT_HISTORY_MAX_AGE_DAYS: u64 = 90;

/// Targets probed when the settings do not name any.
pub const DEFAULT_MONITORING_TARGETS: &[&str] = &[
    "google.com",
    "amazon.com",
    "cloudflare.com",
    "github.com",
    "8.8.8.8",
    "1.1.1.1",
];

/// Ranking window for top talkers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TalkerWindow {
    /// Rank by cumulative bytes since monitoring started.
    #[default]
    AllTime,
    /// Rank by bytes observed in the trailing `secs` seconds.
    Recent { secs: u64 },
}

/// Settings passed into the engine at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network_range: String,
    /// Capture interface; `None` lets the capture backend pick one.
    pub interface: Option<String>,
    pub queue_capacity: usize,
    pub aggregation_workers: usize,
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub publish_interval_secs: u64,
    pub bandwidth_interval_secs: u64,
    pub probe_interval_secs: u64,
    pub scan_interval_secs: u64,
    pub scan_timeout_secs: u64,
    pub scan_program: String,
    pub scan_args: Vec<String>,
    pub inactive_grace_secs: u64,
    pub ring_capacity: usize,
    pub jitter_window: usize,
    pub loss_window: usize,
    pub echo_count: u32,
    pub probe_timeout_ms: u64,
    pub probes_per_second: u32,
    pub connect_port: u16,
    pub monitoring_targets: Vec<String>,
    pub top_talkers: usize,
    pub talker_window: TalkerWindow,
    pub connection_limit: usize,
    pub recent_samples: usize,
    /// SQLite file for connection/device history; disabled when `None`.
    pub history_path: Option<PathBuf>,
    pub history_interval_secs: u64,
    pub history_max_age_days: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network_range: DEFAULT_NETWORK_RANGE.to_string(),
            interface: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            aggregation_workers: DEFAULT_AGGREGATION_WORKERS,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            publish_interval_secs: DEFAULT_PUBLISH_INTERVAL_SECS,
            bandwidth_interval_secs: DEFAULT_BANDWIDTH_INTERVAL_SECS,
            probe_interval_secs: DEFAULT_PROBE_INTERVAL_SECS,
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT_SECS,
            scan_program: "nmap".to_string(),
            scan_args: vec!["-sn".to_string()],
            inactive_grace_secs: DEFAULT_INACTIVE_GRACE_SECS,
            ring_capacity: DEFAULT_RING_CAPACITY,
            jitter_window: DEFAULT_JITTER_WINDOW,
            loss_window: DEFAULT_LOSS_WINDOW,
            echo_count: DEFAULT_ECHO_COUNT,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            probes_per_second: DEFAULT_PROBES_PER_SECOND,
            connect_port: DEFAULT_CONNECT_PORT,
            monitoring_targets: DEFAULT_MONITORING_TARGETS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            top_talkers: DEFAULT_TOP_TALKERS,
            talker_window: TalkerWindow::default(),
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            recent_samples: DEFAULT_RECENT_SAMPLES,
            history_path: None,
            history_interval_secs: DEFAULT_HISTORY_INTERVAL_SECS,
            history_max_age_days: DEFAULT_HISTORY_MAX_AGE_DAYS,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall or disable a pipeline stage.
    pub fn validate(&self) -> Result<()> {
        if self.network_range.trim().is_empty() {
            return Err(Error::Config("network_range must not be empty".into()));
        }
        if self.aggregation_workers == 0 {
            return Err(Error::Config("aggregation_workers must be at least 1".into()));
        }
        if self.queue_capacity < self.aggregation_workers {
            return Err(Error::Config(format!(
                "queue_capacity ({}) must be at least aggregation_workers ({})",
                self.queue_capacity, self.aggregation_workers
            )));
        }
        let capacities = [
            ("ring_capacity", self.ring_capacity),
            ("jitter_window", self.jitter_window),
            ("loss_window", self.loss_window),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        let intervals = [
            ("inactivity_timeout_secs", self.inactivity_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("publish_interval_secs", self.publish_interval_secs),
            ("bandwidth_interval_secs", self.bandwidth_interval_secs),
            ("probe_interval_secs", self.probe_interval_secs),
            ("scan_interval_secs", self.scan_interval_secs),
            ("scan_timeout_secs", self.scan_timeout_secs),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("history_interval_secs", self.history_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if self.probes_per_second == 0 {
            return Err(Error::Config("probes_per_second must be positive".into()));
        }
        if let TalkerWindow::Recent { secs: 0 } = self.talker_window {
            return Err(Error::Config("talker_window.secs must be positive".into()));
        }
        Ok(())
    }

    pub fn inactivity_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactivity_timeout_secs as i64)
    }

    pub fn inactive_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactive_grace_secs as i64)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Per-lane capacity; the total is split evenly, rounding up.
    pub fn lane_capacity(&self) -> usize {
        self.queue_capacity.div_ceil(self.aggregation_workers.max(1))
    }
}
