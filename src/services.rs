//! Background service lifecycle management.
//!
//! `BackgroundServices` owns all scheduled tasks spawned at startup, starting
//! them in dependency order and providing cooperative shutdown: a task that
//! is mid-iteration finishes it before exiting.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::collectors::{run_probe_round, NetworkScanner, ProbePlan, Prober};
use crate::core::metrics::ProbeOutcome;
use crate::core::{FlowAggregator, MetricKind, MetricsEngine, PipelineStats, Snapshot};
use crate::db::{ConnectionHistoryRecord, DeviceTrafficRecord, HistoryStore};
use crate::state::AppState;

/// How often the history recorder prunes old rows.
const PRUNE_CHECK_SECS: u64 = 3600;

/// Cooperative shutdown signal shared by every scheduled task.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `tick` every `period` until shutdown. The first tick fires immediately.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        tracing::debug!("{name} task stopped");
    })
}

/// Manages all scheduled tasks.
///
/// Tasks are started in dependency order:
/// 1. Sweeper (evicts idle connections, writes them to history)
/// 2. Bandwidth tick (per-device speeds)
/// 3. Scanner (device discovery; the first scan runs immediately)
/// 4. Prober (latency, jitter, loss, DNS and connect times)
/// 5. Publisher (snapshots of everything above)
/// 6. History recorder (optional, reads published snapshots)
pub struct BackgroundServices {
    shutdown: Shutdown,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundServices {
    /// Start all scheduled tasks. Must be called from within a tokio runtime.
    pub fn start(
        state: &AppState,
        scanner: Arc<dyn NetworkScanner>,
        prober: Arc<dyn Prober>,
    ) -> anyhow::Result<Self> {
        let settings = &state.settings;
        let rate = NonZeroU32::new(settings.probes_per_second)
            .ok_or_else(|| anyhow::anyhow!("probes_per_second must be positive"))?;
        let shutdown = Shutdown::new();
        let mut tasks = Vec::new();

        // 1. Sweeper
        {
            let flows = Arc::clone(&state.flows);
            let stats = Arc::clone(&state.stats);
            let history = state.history.clone();
            let period = Duration::from_secs(settings.sweep_interval_secs);
            tasks.push((
                "sweep",
                spawn_periodic("sweep", period, shutdown.subscribe(), move || {
                    sweep_once(Arc::clone(&flows), Arc::clone(&stats), history.clone())
                }),
            ));
        }

        // 2. Bandwidth tick
        {
            let registry = Arc::clone(&state.registry);
            let period = Duration::from_secs(settings.bandwidth_interval_secs);
            tasks.push((
                "bandwidth",
                spawn_periodic("bandwidth", period, shutdown.subscribe(), move || {
                    registry.tick_speeds(Instant::now());
                    async {}
                }),
            ));
        }

        // 3. Scanner
        {
            let registry = Arc::clone(&state.registry);
            let stats = Arc::clone(&state.stats);
            let range = settings.network_range.clone();
            let timeout = settings.scan_timeout();
            let period = Duration::from_secs(settings.scan_interval_secs);
            tasks.push((
                "scan",
                spawn_periodic("scan", period, shutdown.subscribe(), move || {
                    let registry = Arc::clone(&registry);
                    let scanner = Arc::clone(&scanner);
                    let stats = Arc::clone(&stats);
                    let range = range.clone();
                    async move {
                        registry.rescan(scanner.as_ref(), &range, timeout, &stats).await;
                    }
                }),
            ));
        }

        // 4. Prober
        {
            let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));
            let metrics = Arc::clone(&state.metrics);
            let stats = Arc::clone(&state.stats);
            let plan = ProbePlan::from(settings);
            let period = Duration::from_secs(settings.probe_interval_secs);
            tasks.push((
                "probe",
                spawn_periodic("probe", period, shutdown.subscribe(), move || {
                    probe_all_targets(
                        Arc::clone(&prober),
                        Arc::clone(&metrics),
                        Arc::clone(&stats),
                        plan,
                        Arc::clone(&limiter),
                    )
                }),
            ));
        }

        // 5. Publisher
        {
            let publisher = Arc::clone(&state.publisher);
            let period = Duration::from_secs(settings.publish_interval_secs);
            tasks.push((
                "publish",
                spawn_periodic("publish", period, shutdown.subscribe(), move || {
                    let snapshot = publisher.publish(Utc::now());
                    tracing::debug!("Published snapshot #{}", snapshot.sequence);
                    async {}
                }),
            ));
        }

        // 6. History recorder
        if let Some(history) = &state.history {
            let history = Arc::clone(history);
            let publisher = Arc::clone(&state.publisher);
            let interval_secs = settings.history_interval_secs;
            let max_age_days = settings.history_max_age_days;
            let prune_every = (PRUNE_CHECK_SECS / interval_secs).max(1);
            let mut ticks = 0u64;
            tasks.push((
                "history",
                spawn_periodic(
                    "history",
                    Duration::from_secs(interval_secs),
                    shutdown.subscribe(),
                    move || {
                        ticks += 1;
                        let prune = ticks % prune_every == 0;
                        record_history(
                            Arc::clone(&history),
                            publisher.latest(),
                            prune.then_some(max_age_days),
                        )
                    },
                ),
            ));
        }

        tracing::info!("Started {} background tasks", tasks.len());
        Ok(Self { shutdown, tasks })
    }

    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Signal every task and wait for them to finish their current iteration.
    pub async fn shutdown(mut self) {
        self.shutdown.trigger();
        for (name, handle) in std::mem::take(&mut self.tasks) {
            if let Err(e) = handle.await {
                tracing::error!("{name} task failed during shutdown: {e}");
            }
        }
        tracing::info!("Background tasks stopped");
    }
}

impl Drop for BackgroundServices {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            tracing::warn!("BackgroundServices dropped without shutdown, signalling tasks to stop");
            self.shutdown.trigger();
        }
    }
}

async fn sweep_once(flows: Arc<FlowAggregator>, stats: Arc<PipelineStats>, history: Option<Arc<HistoryStore>>) {
    let now = Utc::now();
    let evicted = flows.sweep(now);
    if evicted.is_empty() {
        return;
    }
    stats.record_evictions(evicted.len() as u64);

    if let Some(history) = history {
        let records: Vec<ConnectionHistoryRecord> = evicted
            .iter()
            .map(|c| ConnectionHistoryRecord::from_closed(c, now))
            .collect();
        let written = tokio::task::spawn_blocking(move || history.insert_connections(&records)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Failed to record connection history: {e}"),
            Err(e) => tracing::error!("Connection history writer panicked: {e}"),
        }
    }
}

async fn probe_all_targets(
    prober: Arc<dyn Prober>,
    metrics: Arc<MetricsEngine>,
    stats: Arc<PipelineStats>,
    plan: ProbePlan,
    limiter: Arc<DefaultDirectRateLimiter>,
) {
    for target in metrics.targets() {
        let round = run_probe_round(prober.as_ref(), &target, &plan, &limiter).await;
        for err in &round.errors {
            stats.record_probe_failure(err, Utc::now());
        }
        for result in round.results {
            if result.outcome == ProbeOutcome::EchoTimeout {
                stats.record_probe_timeout();
            }
            metrics.record(result);
        }
    }
}

async fn record_history(history: Arc<HistoryStore>, snapshot: Arc<Snapshot>, prune_days: Option<u64>) {
    let written = tokio::task::spawn_blocking(move || -> crate::error::Result<()> {
        let records: Vec<DeviceTrafficRecord> = snapshot
            .devices
            .iter()
            .filter(|d| d.total_bytes() > 0)
            .map(|d| DeviceTrafficRecord::from_device(d, snapshot.timestamp))
            .collect();
        if !records.is_empty() {
            history.insert_device_batch(&records)?;
        }
        if let Some(days) = prune_days {
            history.prune_old_records(days)?;
        }
        Ok(())
    })
    .await;

    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Failed to record device history: {e}"),
        Err(e) => tracing::error!("Device history writer panicked: {e}"),
    }
}

/// One-line summary of a snapshot for periodic status logging.
pub fn status_line(snapshot: &Snapshot) -> String {
    let total_down: f64 = snapshot.devices.iter().map(|d| d.download_speed).sum();
    let total_up: f64 = snapshot.devices.iter().map(|d| d.upload_speed).sum();

    let mut line = format!(
        "#{} devices={} connections={} \u{2193} {} \u{2191} {}",
        snapshot.sequence,
        snapshot.devices.len(),
        snapshot.active_connections,
        format_speed_compact(total_down),
        format_speed_compact(total_up)
    );

    if let Some(top) = snapshot.top_talkers.first() {
        let name = top.hostname.clone().unwrap_or_else(|| top.address.to_string());
        line.push_str(&format!(" top={name} ({})", format_bytes(top.bytes)));
    }

    if let Some(target) = snapshot.metrics.first() {
        let latency = target.summaries.get(&MetricKind::Latency).map(|s| s.current);
        let loss = target.summaries.get(&MetricKind::Loss).map(|s| s.current);
        if let (Some(latency), Some(loss)) = (latency, loss) {
            line.push_str(&format!(
                " {}: {latency:.1} ms, {:.0}% loss",
                target.target,
                loss * 100.0
            ));
        }
    }

    let p = &snapshot.pipeline;
    if p.parse_errors + p.queue_overflows + p.capture_faults + p.scan_faults > 0 {
        line.push_str(&format!(
            " [parse_errors={} overflows={} capture_faults={} scan_faults={}]",
            p.parse_errors, p.queue_overflows, p.capture_faults, p.scan_faults
        ));
    }
    line
}

/// Format a speed value in a compact human-readable form.
pub fn format_speed_compact(bps: f64) -> String {
    if bps < 1024.0 {
        format!("{:.0} B/s", bps)
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else {
        format!("{:.2} MB/s", bps / (1024.0 * 1024.0))
    }
}

/// Format a byte count in a compact human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    let b = bytes as f64;
    if b < 1024.0 {
        format!("{bytes} B")
    } else if b < 1024.0 * 1024.0 {
        format!("{:.1} KB", b / 1024.0)
    } else if b < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", b / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", b / (1024.0 * 1024.0 * 1024.0))
    }
}
