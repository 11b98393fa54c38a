use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use netvision_lib::capture::PacketSource;
use netvision_lib::collectors::{NmapScanner, SystemProber};
use netvision_lib::config::Settings;
use netvision_lib::core::Snapshot;
use netvision_lib::services::status_line;
use netvision_lib::Monitor;

#[derive(Parser)]
#[command(name = "netvision", version, about = "Local network monitor")]
struct Cli {
    /// TOML settings file; missing keys fall back to defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network range to scan, e.g. 192.168.1.0/24.
    #[arg(short, long)]
    range: Option<String>,

    /// Capture interface (default device when omitted).
    #[arg(short, long)]
    interface: Option<String>,

    /// SQLite file for connection and device history.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Write every status snapshot as JSON to this file.
    #[arg(long)]
    snapshot_file: Option<PathBuf>,

    /// Seconds between status lines.
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(range) = &cli.range {
        settings.network_range = range.clone();
    }
    if let Some(interface) = &cli.interface {
        settings.interface = Some(interface.clone());
    }
    if let Some(history) = &cli.history {
        settings.history_path = Some(history.clone());
    }
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

#[cfg(feature = "pcap")]
fn open_capture(settings: &Settings) -> Option<Box<dyn PacketSource>> {
    use netvision_lib::capture::pcap_backend::PcapSource;

    match PcapSource::open(settings.interface.as_deref()) {
        Ok(source) => Some(Box::new(source)),
        Err(e) => {
            tracing::warn!("Packet capture unavailable: {e}. Running in scan/probe-only mode.");
            None
        }
    }
}

#[cfg(not(feature = "pcap"))]
fn open_capture(_settings: &Settings) -> Option<Box<dyn PacketSource>> {
    tracing::warn!("Built without the `pcap` feature; traffic accounting is disabled.");
    None
}

async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    netvision_lib::init_tracing();
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let source = open_capture(&settings);
    let scanner = Arc::new(NmapScanner::from_settings(&settings));
    let prober = Arc::new(SystemProber::new());
    let monitor = Monitor::start(settings, source, scanner, prober)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.status_interval.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for Ctrl-C: {e}");
                }
                break;
            }
            _ = ticker.tick() => {
                let snapshot = monitor.latest();
                tracing::info!("{}", status_line(&snapshot));
                if let Some(path) = &cli.snapshot_file {
                    if let Err(e) = write_snapshot(path, &snapshot).await {
                        tracing::warn!("{e:#}");
                    }
                }
            }
        }
    }

    tracing::info!("Shutting down");
    let last = monitor.shutdown().await;
    if let Some(path) = &cli.snapshot_file {
        write_snapshot(path, &last).await?;
    }
    tracing::info!("{}", status_line(&last));
    Ok(())
}
