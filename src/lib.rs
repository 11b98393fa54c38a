pub mod capture;
pub mod collectors;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod services;
pub mod state;

use std::sync::Arc;

use crate::capture::{CaptureEngine, PacketSource};
use crate::collectors::{NetworkScanner, Prober};
use crate::config::Settings;
use crate::core::Snapshot;
use crate::services::BackgroundServices;
use crate::state::AppState;

pub use error::{Error, Result};

/// Install the tracing subscriber and a panic hook that logs through it.
pub fn init_tracing() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("PANIC in NetVision: {info}");
        default_hook(info);
    }));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netvision_lib=info,netvision=info".into()),
        )
        .init();
}

/// A running monitor: shared state, scheduled tasks and (optionally) capture.
pub struct Monitor {
    state: Arc<AppState>,
    services: BackgroundServices,
    capture: Option<CaptureEngine>,
}

impl Monitor {
    /// Build every component and start it. Must be called from within a tokio runtime.
    ///
    /// Without a packet source the monitor runs in scan/probe-only mode.
    pub fn start(
        settings: Settings,
        source: Option<Box<dyn PacketSource>>,
        scanner: Arc<dyn NetworkScanner>,
        prober: Arc<dyn Prober>,
    ) -> anyhow::Result<Self> {
        let state = Arc::new(AppState::new(settings)?);

        // Scheduled tasks first, so the publisher is live before traffic arrives.
        let services = BackgroundServices::start(&state, scanner, prober)?;

        let capture = match source {
            Some(source) => {
                let started = CaptureEngine::start(
                    source,
                    Arc::clone(&state.queue),
                    Arc::clone(&state.flows),
                    Arc::clone(&state.stats),
                );
                match started {
                    Ok(engine) => Some(engine),
                    Err(e) => {
                        // Tasks already running finish their current iteration and exit.
                        services.shutdown_signal().trigger();
                        return Err(e.context("failed to start capture"));
                    }
                }
            }
            None => {
                tracing::warn!("No packet source; running in scan/probe-only mode");
                None
            }
        };

        tracing::info!("NetVision monitoring {}", state.settings.network_range);
        Ok(Self {
            state,
            services,
            capture,
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn latest(&self) -> Arc<Snapshot> {
        self.state.publisher.latest()
    }

    /// Stop capture (draining queued events), then the scheduled tasks, and
    /// publish one final snapshot of the drained state.
    pub async fn shutdown(self) -> Arc<Snapshot> {
        if let Some(engine) = self.capture {
            if let Err(e) = tokio::task::spawn_blocking(move || engine.join()).await {
                tracing::error!("Capture shutdown failed: {e}");
            }
        }
        self.services.shutdown().await;
        self.state.publisher.publish(chrono::Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{IterSource, RawPacket};
    use crate::collectors::ScanResult;
    use async_trait::async_trait;
    use etherparse::PacketBuilder;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    struct StaticScanner;

    #[async_trait]
    impl NetworkScanner for StaticScanner {
        async fn scan(&self, _range: &str) -> Result<Vec<ScanResult>> {
            Ok(vec![ScanResult {
                address: IpAddr::V4(Ipv4Addr::new(192, 168, 7, 1)),
                hostname: Some("gateway.lan".into()),
                mac: None,
                open_ports: Vec::new(),
            }])
        }
    }

    struct SilentProber;

    #[async_trait]
    impl Prober for SilentProber {
        async fn echo(&self, _target: &str, _timeout: Duration) -> Result<Option<Duration>> {
            Ok(Some(Duration::from_millis(5)))
        }

        async fn resolve(&self, _host: &str, _timeout: Duration) -> Result<Duration> {
            Ok(Duration::from_millis(2))
        }

        async fn connect(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<Duration> {
            Ok(Duration::from_millis(9))
        }
    }

    fn frame(sport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
            .ipv4([192, 168, 7, 20], [192, 168, 7, 1], 64)
            .tcp(sport, 443, 1, 1024);
        let mut out = Vec::new();
        builder.write(&mut out, &[0u8; 10]).unwrap();
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_end_to_end() {
        let settings = Settings {
            monitoring_targets: vec!["1.1.1.1".into()],
            echo_count: 2,
            ..Settings::default()
        };
        let now = chrono::Utc::now();
        let packets: Vec<Result<RawPacket>> = (0..50)
            .map(|i| Ok(RawPacket::ethernet(now, frame(40000 + (i % 5)))))
            .collect();

        let monitor = Monitor::start(
            settings,
            Some(Box::new(IterSource::new(packets.into_iter()))),
            Arc::new(StaticScanner),
            Arc::new(SilentProber),
        )
        .unwrap();

        let flows = Arc::clone(&monitor.state().flows);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while flows.total_packets() < 50 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let snapshot = monitor.shutdown().await;
        assert_eq!(snapshot.pipeline.flow_events, 50);
        assert_eq!(snapshot.active_connections, 5);

        let gateway = snapshot
            .device(&IpAddr::V4(Ipv4Addr::new(192, 168, 7, 1)))
            .expect("gateway known from traffic and scan");
        assert_eq!(gateway.packets_received, 50);
        assert!(snapshot.metrics.iter().any(|m| m.target == "1.1.1.1"));
    }
}
