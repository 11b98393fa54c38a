//! Network performance metrics derived from probe results.
//!
//! Each target owns one fixed-capacity ring per [`MetricKind`]. Latency comes
//! straight from echo replies; jitter and loss are recomputed over sliding
//! windows on every echo outcome. Milliseconds throughout, except loss, which
//! is a ratio in `[0, 1]`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::gate::StateGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Latency,
    Jitter,
    Loss,
    DnsTime,
    ConnectTime,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Latency,
        MetricKind::Jitter,
        MetricKind::Loss,
        MetricKind::DnsTime,
        MetricKind::ConnectTime,
    ];
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Latency => "latency",
            MetricKind::Jitter => "jitter",
            MetricKind::Loss => "loss",
            MetricKind::DnsTime => "dns_time",
            MetricKind::ConnectTime => "connect_time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub target: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one probe against one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    EchoReply(Duration),
    /// The echo went unanswered. Counts toward loss; not an error.
    EchoTimeout,
    Resolved(Duration),
    ResolveFailed,
    Connected(Duration),
    ConnectFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub target: String,
    pub at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub count: usize,
}

impl MetricSummary {
    fn from_values(values: &[f64]) -> Option<Self> {
        let current = *values.last()?;
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Some(Self {
            current,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sorted.iter().sum::<f64>() / count as f64,
            median,
            count,
        })
    }
}

/// Per-target metrics as published in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    pub target: String,
    pub summaries: BTreeMap<MetricKind, MetricSummary>,
    pub failures: BTreeMap<MetricKind, u64>,
}

/// Window and ring sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsConfig {
    pub ring_capacity: usize,
    pub jitter_window: usize,
    pub loss_window: usize,
}

struct TargetMetrics {
    rings: HashMap<MetricKind, VecDeque<MetricSample>>,
    latencies: VecDeque<f64>,
    answered: VecDeque<bool>,
    failures: HashMap<MetricKind, u64>,
}

impl TargetMetrics {
    fn new() -> Self {
        Self {
            rings: HashMap::new(),
            latencies: VecDeque::new(),
            answered: VecDeque::new(),
            failures: HashMap::new(),
        }
    }

    fn push(&mut self, capacity: usize, sample: MetricSample) {
        let ring = self
            .rings
            .entry(sample.kind)
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        if ring.len() == capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    fn values(&self, kind: MetricKind) -> Vec<f64> {
        self.rings
            .get(&kind)
            .map(|ring| ring.iter().map(|s| s.value).collect())
            .unwrap_or_default()
    }
}

fn push_windowed<T>(window: &mut VecDeque<T>, limit: usize, value: T) {
    if window.len() == limit {
        window.pop_front();
    }
    window.push_back(value);
}

/// Mean absolute difference between consecutive values; `None` below two values.
pub fn jitter(latencies: &[f64]) -> Option<f64> {
    if latencies.len() < 2 {
        return None;
    }
    let total: f64 = latencies.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    Some(total / (latencies.len() - 1) as f64)
}

fn to_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

pub struct MetricsEngine {
    targets: DashMap<String, TargetMetrics>,
    gate: Arc<StateGate>,
    config: MetricsConfig,
}

impl MetricsEngine {
    pub fn new(gate: Arc<StateGate>, config: MetricsConfig) -> Self {
        let config = MetricsConfig {
            ring_capacity: config.ring_capacity.max(1),
            jitter_window: config.jitter_window.max(2),
            loss_window: config.loss_window.max(1),
        };
        Self {
            targets: DashMap::new(),
            gate,
            config,
        }
    }

    /// Register a target. Returns `false` if it was already known.
    pub fn add_target(&self, target: &str) -> bool {
        let _guard = self.gate.update();
        if self.targets.contains_key(target) {
            return false;
        }
        self.targets.insert(target.to_string(), TargetMetrics::new());
        true
    }

    /// Registered targets, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.targets.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets
    }

    /// Fold one probe result in. Returns the samples it produced.
    pub fn record(&self, result: ProbeResult) -> Vec<MetricSample> {
        let _guard = self.gate.update();
        let cfg = self.config;
        let mut entry = self
            .targets
            .entry(result.target.clone())
            .or_insert_with(TargetMetrics::new);
        let metrics = entry.value_mut();

        let sample = |kind: MetricKind, value: f64| MetricSample {
            kind,
            target: result.target.clone(),
            value,
            timestamp: result.at,
        };
        let mut produced = Vec::new();

        match result.outcome {
            ProbeOutcome::EchoReply(rtt) => {
                let ms = to_millis(rtt);
                produced.push(sample(MetricKind::Latency, ms));
                push_windowed(&mut metrics.latencies, cfg.jitter_window, ms);
                let window: Vec<f64> = metrics.latencies.iter().copied().collect();
                if let Some(j) = jitter(&window) {
                    produced.push(sample(MetricKind::Jitter, j));
                }
                push_windowed(&mut metrics.answered, cfg.loss_window, true);
                produced.push(sample(MetricKind::Loss, loss_ratio(&metrics.answered)));
            }
            ProbeOutcome::EchoTimeout => {
                push_windowed(&mut metrics.answered, cfg.loss_window, false);
                produced.push(sample(MetricKind::Loss, loss_ratio(&metrics.answered)));
            }
            ProbeOutcome::Resolved(d) => produced.push(sample(MetricKind::DnsTime, to_millis(d))),
            ProbeOutcome::Connected(d) => produced.push(sample(MetricKind::ConnectTime, to_millis(d))),
            ProbeOutcome::ResolveFailed => {
                *metrics.failures.entry(MetricKind::DnsTime).or_insert(0) += 1;
            }
            ProbeOutcome::ConnectFailed => {
                *metrics.failures.entry(MetricKind::ConnectTime).or_insert(0) += 1;
            }
        }

        for s in &produced {
            metrics.push(cfg.ring_capacity, s.clone());
        }
        produced
    }

    /// Most recent sample of `kind` for `target`.
    pub fn sample(&self, kind: MetricKind, target: &str) -> Option<MetricSample> {
        self.targets
            .get(target)?
            .rings
            .get(&kind)?
            .back()
            .cloned()
    }

    /// Ring contents, oldest first.
    pub fn history(&self, kind: MetricKind, target: &str) -> Vec<MetricSample> {
        self.targets
            .get(target)
            .and_then(|t| t.rings.get(&kind).map(|ring| ring.iter().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn summary(&self, kind: MetricKind, target: &str) -> Option<MetricSummary> {
        let values = self.targets.get(target)?.values(kind);
        MetricSummary::from_values(&values)
    }

    pub fn failures(&self, kind: MetricKind, target: &str) -> u64 {
        self.targets
            .get(target)
            .and_then(|t| t.failures.get(&kind).copied())
            .unwrap_or(0)
    }

    /// Summaries of every target, sorted by target. Caller holds the gate.
    pub fn summaries(&self) -> Vec<TargetSummary> {
        let mut out: Vec<TargetSummary> = self
            .targets
            .iter()
            .map(|entry| {
                let metrics = entry.value();
                let summaries = MetricKind::ALL
                    .iter()
                    .filter_map(|&kind| {
                        MetricSummary::from_values(&metrics.values(kind)).map(|s| (kind, s))
                    })
                    .collect();
                let failures = metrics.failures.iter().map(|(k, v)| (*k, *v)).collect();
                TargetSummary {
                    target: entry.key().clone(),
                    summaries,
                    failures,
                }
            })
            .collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    /// Up to `per_series` newest samples of every (target, kind), oldest first.
    pub fn recent_samples(&self, per_series: usize) -> Vec<MetricSample> {
        let mut out: Vec<MetricSample> = Vec::new();
        for entry in self.targets.iter() {
            for ring in entry.value().rings.values() {
                let skip = ring.len().saturating_sub(per_series);
                out.extend(ring.iter().skip(skip).cloned());
            }
        }
        out.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.target.cmp(&b.target))
                .then_with(|| a.kind.cmp(&b.kind))
        });
        out
    }
}

fn loss_ratio(answered: &VecDeque<bool>) -> f64 {
    if answered.is_empty() {
        return 0.0;
    }
    let lost = answered.iter().filter(|ok| !**ok).count();
    lost as f64 / answered.len() as f64
}
