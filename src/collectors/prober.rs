//! Performance probing: ICMP echo via the system `ping`, plus timed DNS
//! resolution and TCP connect through tokio.

use std::net::IpAddr;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use governor::DefaultDirectRateLimiter;
use tokio::net::{lookup_host, TcpStream};
use tokio::process::Command;

use crate::config::Settings;
use crate::core::metrics::{ProbeOutcome, ProbeResult};
use crate::error::{Error, Result};

/// Extra time granted to `ping` beyond its own reply deadline.
const PING_GRACE: Duration = Duration::from_secs(1);

/// The external network-probing collaborator.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Round-trip time of one echo, or `Ok(None)` if no reply arrived in time.
    async fn echo(&self, target: &str, timeout: Duration) -> Result<Option<Duration>>;

    /// Time to resolve `host`.
    async fn resolve(&self, host: &str, timeout: Duration) -> Result<Duration>;

    /// Time to establish a TCP connection to `host:port`.
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Duration>;
}

/// True when `target` is a literal IPv4/IPv6 address rather than a hostname.
pub fn is_ip_address(target: &str) -> bool {
    target.parse::<IpAddr>().is_ok()
}

/// Extract the RTT from one line of `ping` output (`time=12.3 ms` or `time<1ms`).
pub fn parse_ping_rtt(output: &str) -> Option<Duration> {
    let idx = output.find("time=").or_else(|| output.find("time<"))?;
    let rest = &output[idx + 5..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let ms: f64 = rest[..end].parse().ok()?;
    Some(Duration::from_secs_f64(ms / 1000.0))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProber;

impl SystemProber {
    pub fn new() -> Self {
        Self
    }
}

fn ping_args(target: &str, timeout: Duration) -> Vec<String> {
    if cfg!(windows) {
        vec!["-n".into(), "1".into(), "-w".into(), timeout.as_millis().to_string(), target.into()]
    } else {
        let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
        vec!["-c".into(), "1".into(), "-W".into(), secs.to_string(), target.into()]
    }
}

#[async_trait]
impl Prober for SystemProber {
    async fn echo(&self, target: &str, timeout: Duration) -> Result<Option<Duration>> {
        let run = Command::new("ping")
            .args(ping_args(target, timeout))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout + PING_GRACE, run).await {
            Err(_) => return Ok(None),
            Ok(result) => result.map_err(|e| Error::Probe(format!("failed to run ping: {e}")))?,
        };

        // Non-zero exit: no reply (host unreachable or deadline hit).
        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_rtt(&stdout)
            .map(Some)
            .ok_or_else(|| Error::Probe(format!("no RTT in ping output for {target}")))
    }

    async fn resolve(&self, host: &str, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        let mut addrs = tokio::time::timeout(timeout, lookup_host((host, 0)))
            .await
            .map_err(|_| Error::Probe(format!("DNS lookup for {host} timed out")))?
            .map_err(|e| Error::Probe(format!("DNS lookup for {host} failed: {e}")))?;
        if addrs.next().is_none() {
            return Err(Error::Probe(format!("{host} resolved to no addresses")));
        }
        Ok(start.elapsed())
    }

    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Probe(format!("connect to {host}:{port} timed out")))?
            .map_err(|e| Error::Probe(format!("connect to {host}:{port} failed: {e}")))?;
        Ok(start.elapsed())
    }
}

/// What one probe round issues per target.
#[derive(Debug, Clone, Copy)]
pub struct ProbePlan {
    pub echo_count: u32,
    pub timeout: Duration,
    pub connect_port: u16,
}

impl From<&Settings> for ProbePlan {
    fn from(settings: &Settings) -> Self {
        Self {
            echo_count: settings.echo_count,
            timeout: settings.probe_timeout(),
            connect_port: settings.connect_port,
        }
    }
}

/// Outcome of probing one target once.
#[derive(Debug, Default)]
pub struct ProbeRound {
    pub results: Vec<ProbeResult>,
    /// Probes that could not be issued at all.
    pub errors: Vec<Error>,
}

/// Issue `plan.echo_count` echoes, then (hostnames only) one DNS and one
/// connect probe. Every probe waits for the shared rate limiter first.
pub async fn run_probe_round(
    prober: &dyn Prober,
    target: &str,
    plan: &ProbePlan,
    limiter: &DefaultDirectRateLimiter,
) -> ProbeRound {
    let mut round = ProbeRound::default();
    let mut push = |outcome: ProbeOutcome| {
        round.results.push(ProbeResult {
            target: target.to_string(),
            at: Utc::now(),
            outcome,
        })
    };

    let mut errors = Vec::new();
    for _ in 0..plan.echo_count {
        limiter.until_ready().await;
        match prober.echo(target, plan.timeout).await {
            Ok(Some(rtt)) => push(ProbeOutcome::EchoReply(rtt)),
            Ok(None) => push(ProbeOutcome::EchoTimeout),
            Err(e) => {
                tracing::debug!("echo to {target} not issued: {e}");
                errors.push(e);
            }
        }
    }

    if !is_ip_address(target) {
        limiter.until_ready().await;
        match prober.resolve(target, plan.timeout).await {
            Ok(elapsed) => push(ProbeOutcome::Resolved(elapsed)),
            Err(e) => {
                tracing::debug!("{e}");
                push(ProbeOutcome::ResolveFailed);
            }
        }

        limiter.until_ready().await;
        match prober.connect(target, plan.connect_port, plan.timeout).await {
            Ok(elapsed) => push(ProbeOutcome::Connected(elapsed)),
            Err(e) => {
                tracing::debug!("{e}");
                push(ProbeOutcome::ConnectFailed);
            }
        }
    }

    round.errors = errors;
    round
}
