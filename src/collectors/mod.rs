//! Adapters for the external collaborators: host discovery and probing.
//!
//! - [`NetworkScanner`] / [`NmapScanner`] — subprocess scan with structured output parsing
//! - [`Prober`] / [`SystemProber`] — echo, DNS and TCP connect timing

pub mod prober;
pub mod scanner;

pub use prober::{is_ip_address, run_probe_round, ProbePlan, Prober, SystemProber};
pub use scanner::{parse_nmap_output, NetworkScanner, NmapScanner, ScanResult};
