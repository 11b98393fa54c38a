//! Host discovery through an `nmap` subprocess.

use std::net::IpAddr;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::config::Settings;
use crate::error::{Error, Result};

/// One host reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub address: IpAddr,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub open_ports: Vec<u16>,
}

/// The external network-scanning facility.
///
/// Implementations should return promptly when the future is dropped; the
/// registry enforces the scan timeout by dropping it.
#[async_trait]
pub trait NetworkScanner: Send + Sync {
    async fn scan(&self, range: &str) -> Result<Vec<ScanResult>>;
}

pub struct NmapScanner {
    program: String,
    args: Vec<String>,
}

impl NmapScanner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.scan_program.clone(), settings.scan_args.clone())
    }
}

#[async_trait]
impl NetworkScanner for NmapScanner {
    async fn scan(&self, range: &str) -> Result<Vec<ScanResult>> {
        tracing::debug!("Running {} {:?} {range}", self.program, self.args);

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(range)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Scan(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Scan(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_nmap_output(&String::from_utf8_lossy(&output.stdout))
    }
}

const REPORT_PREFIX: &str = "Nmap scan report for ";
const MAC_PREFIX: &str = "MAC Address: ";

/// Parse nmap's normal (human-readable) output.
///
/// Recognized lines:
/// - `Nmap scan report for router.lan (192.168.1.1)` / `Nmap scan report for 192.168.1.7`
/// - `MAC Address: AA:BB:CC:DD:EE:FF (Vendor)`
/// - `22/tcp open  ssh`
pub fn parse_nmap_output(text: &str) -> Result<Vec<ScanResult>> {
    let mut hosts: Vec<ScanResult> = Vec::new();

    for line in text.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix(REPORT_PREFIX) {
            hosts.push(parse_report_line(rest)?);
        } else if let Some(rest) = line.strip_prefix(MAC_PREFIX) {
            if let (Some(host), Some(mac)) = (hosts.last_mut(), rest.split_whitespace().next()) {
                host.mac = Some(mac.to_string());
            }
        } else if let Some(port) = parse_open_port(line) {
            if let Some(host) = hosts.last_mut() {
                if !host.open_ports.contains(&port) {
                    host.open_ports.push(port);
                }
            }
        }
    }

    for host in &mut hosts {
        host.open_ports.sort_unstable();
    }
    Ok(hosts)
}

fn parse_report_line(rest: &str) -> Result<ScanResult> {
    let (hostname, addr) = match rest.rsplit_once(" (") {
        Some((name, addr)) => (Some(name.to_string()), addr.trim_end_matches(')')),
        None => (None, rest),
    };
    let address = addr
        .parse::<IpAddr>()
        .map_err(|_| Error::Scan(format!("unparseable scan report: {rest}")))?;
    Ok(ScanResult {
        address,
        hostname,
        mac: None,
        open_ports: Vec::new(),
    })
}

fn parse_open_port(line: &str) -> Option<u16> {
    let mut fields = line.split_whitespace();
    let spec = fields.next()?;
    if fields.next()? != "open" {
        return None;
    }
    let (port, proto) = spec.split_once('/')?;
    if !matches!(proto, "tcp" | "udp" | "sctp") {
        return None;
    }
    port.parse().ok()
}
