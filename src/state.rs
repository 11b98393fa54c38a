//! Shared engine state: every component, wired once from [`Settings`].

use std::sync::Arc;

use anyhow::Context;

use crate::capture::IngestQueue;
use crate::config::Settings;
use crate::core::metrics::MetricsConfig;
use crate::core::{
    DeviceRegistry, DeviceTable, FlowAggregator, MetricsEngine, PipelineStats, SnapshotOptions,
    SnapshotPublisher, StateGate,
};
use crate::db::HistoryStore;

pub struct AppState {
    pub settings: Settings,
    pub gate: Arc<StateGate>,
    pub stats: Arc<PipelineStats>,
    pub devices: Arc<DeviceTable>,
    pub flows: Arc<FlowAggregator>,
    pub metrics: Arc<MetricsEngine>,
    pub registry: Arc<DeviceRegistry>,
    pub publisher: Arc<SnapshotPublisher>,
    pub queue: Arc<IngestQueue>,
    /// Present when a history database path is configured.
    pub history: Option<Arc<HistoryStore>>,
}

impl AppState {
    /// Validate `settings` and build all components in dependency order.
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        settings.validate().context("invalid settings")?;

        let gate = Arc::new(StateGate::new());
        let stats = Arc::new(PipelineStats::default());
        let devices = Arc::new(DeviceTable::new(settings.talker_window));

        let queue = Arc::new(IngestQueue::new(
            settings.aggregation_workers,
            settings.lane_capacity(),
            Arc::clone(&stats),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&devices),
            Arc::clone(&gate),
            settings.inactive_grace(),
        ));
        let flows = Arc::new(FlowAggregator::new(
            Arc::clone(&devices),
            Arc::clone(&gate),
            settings.inactivity_timeout(),
        ));
        let metrics = Arc::new(MetricsEngine::new(
            Arc::clone(&gate),
            MetricsConfig {
                ring_capacity: settings.ring_capacity,
                jitter_window: settings.jitter_window,
                loss_window: settings.loss_window,
            },
        ));
        for target in &settings.monitoring_targets {
            metrics.add_target(target);
        }
        let publisher = Arc::new(SnapshotPublisher::new(
            Arc::clone(&flows),
            Arc::clone(&metrics),
            Arc::clone(&registry),
            Arc::clone(&stats),
            Arc::clone(&gate),
            SnapshotOptions::from(&settings),
        ));

        let history = match &settings.history_path {
            Some(path) => {
                let store = HistoryStore::open(path)
                    .with_context(|| format!("failed to open history database {}", path.display()))?;
                tracing::info!("History database opened at {}", path.display());
                Some(Arc::new(store))
            }
            None => None,
        };

        Ok(Self {
            settings,
            gate,
            stats,
            devices,
            flows,
            metrics,
            registry,
            publisher,
            queue,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registers_default_targets() {
        let state = AppState::new(Settings::default()).unwrap();
        assert_eq!(state.metrics.targets().len(), Settings::default().monitoring_targets.len());
        assert_eq!(state.queue.lanes(), state.settings.aggregation_workers);
        assert!(state.history.is_none());
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let settings = Settings {
            ring_capacity: 0,
            ..Settings::default()
        };
        assert!(AppState::new(settings).is_err());
    }

    #[test]
    fn test_new_opens_history_store() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            history_path: Some(dir.path().join("netvision.db")),
            ..Settings::default()
        };
        let state = AppState::new(settings).unwrap();
        assert!(state.history.is_some());
    }
}
