//! Capture ingest: raw packets in, flow events out.
//!
//! The capture facility itself is external and plugs in through
//! [`PacketSource`]. [`CaptureEngine`] drives a source on a dedicated OS
//! thread, normalizes every packet with [`parse_packet`], and hands the
//! resulting [`FlowEvent`]s to the aggregation workers through the laned
//! [`IngestQueue`].
//!
//! - libpcap live capture: `pcap_backend` (cargo feature `pcap`)

#[cfg(feature = "pcap")]
pub mod pcap_backend;
pub mod queue;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use etherparse::{LaxNetSlice, LaxSlicedPacket, TransportSlice};
use serde::{Deserialize, Serialize};

use crate::core::flow::FlowAggregator;
use crate::core::stats::PipelineStats;
use crate::error::Result;

pub use queue::IngestQueue;

/// First retry delay after a capture fault.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Retry delay ceiling after repeated capture faults.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// How often idle aggregation workers check for shutdown.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Transport protocol tag of a flow event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Any other IP payload. Ports are reported as 0.
    Other,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Other => "Other",
        };
        f.write_str(name)
    }
}

/// One observed packet, normalized. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEvent {
    pub timestamp: DateTime<Utc>,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// On-wire length in bytes.
    pub length: u64,
}

/// Framing of the bytes handed over by the capture facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II frames (optionally VLAN tagged).
    Ethernet,
    /// Bare IPv4/IPv6 packets with no link header.
    RawIp,
}

/// A packet buffer as delivered by the capture facility.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    /// Original length on the wire; may exceed `data.len()` when the capture is truncated.
    pub wire_len: u64,
    pub link: LinkType,
}

impl RawPacket {
    pub fn ethernet(timestamp: DateTime<Utc>, data: Vec<u8>) -> Self {
        let wire_len = data.len() as u64;
        Self {
            timestamp,
            data,
            wire_len,
            link: LinkType::Ethernet,
        }
    }

    pub fn raw_ip(timestamp: DateTime<Utc>, data: Vec<u8>) -> Self {
        let wire_len = data.len() as u64;
        Self {
            timestamp,
            data,
            wire_len,
            link: LinkType::RawIp,
        }
    }
}

/// Why a packet was discarded instead of becoming a flow event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// ARP and other non-IP frames.
    #[error("not an IP packet")]
    NotIp,
}

/// Parse link, network, and transport headers into a flow event.
///
/// Parsing is lax about the payload: a snaplen-truncated capture still yields
/// an event as long as every header is present.
pub fn parse_packet(raw: &RawPacket) -> std::result::Result<FlowEvent, ParseError> {
    let sliced = match raw.link {
        LinkType::Ethernet => LaxSlicedPacket::from_ethernet(&raw.data)
            .map_err(|e| ParseError::Malformed(e.to_string()))?,
        LinkType::RawIp => LaxSlicedPacket::from_ip(&raw.data)
            .map_err(|e| ParseError::Malformed(e.to_string()))?,
    };

    // A header cut short or invalid; payload truncation alone never lands here.
    if let Some((err, _layer)) = &sliced.stop_err {
        return Err(ParseError::Malformed(err.to_string()));
    }

    let (src, dst) = match &sliced.net {
        Some(LaxNetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                IpAddr::V4(header.source_addr()),
                IpAddr::V4(header.destination_addr()),
            )
        }
        Some(LaxNetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::V6(header.source_addr()),
                IpAddr::V6(header.destination_addr()),
            )
        }
        _ => return Err(ParseError::NotIp),
    };

    let (protocol, src_port, dst_port) = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => (Protocol::Tcp, tcp.source_port(), tcp.destination_port()),
        Some(TransportSlice::Udp(udp)) => (Protocol::Udp, udp.source_port(), udp.destination_port()),
        Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => (Protocol::Icmp, 0, 0),
        _ => (Protocol::Other, 0, 0),
    };

    Ok(FlowEvent {
        timestamp: raw.timestamp,
        src,
        dst,
        src_port,
        dst_port,
        protocol,
        length: raw.wire_len,
    })
}

/// What a capture source produced on one read.
#[derive(Debug)]
pub enum SourceEvent {
    Packet(RawPacket),
    /// Nothing arrived within the source's read timeout.
    Idle,
    /// The source will never produce another packet (end of file, device closed).
    Exhausted,
}

/// The external packet-capture facility.
///
/// `next_event` may block, but only for the source's own read timeout so the
/// ingest thread can observe shutdown.
pub trait PacketSource: Send + 'static {
    fn next_event(&mut self) -> Result<SourceEvent>;
}

/// Adapts any iterator of packets (or faults) into a [`PacketSource`].
/// The source is exhausted when the iterator ends.
pub struct IterSource<I> {
    inner: I,
}

impl<I> IterSource<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I> PacketSource for IterSource<I>
where
    I: Iterator<Item = Result<RawPacket>> + Send + 'static,
{
    fn next_event(&mut self) -> Result<SourceEvent> {
        match self.inner.next() {
            Some(Ok(packet)) => Ok(SourceEvent::Packet(packet)),
            Some(Err(e)) => Err(e),
            None => Ok(SourceEvent::Exhausted),
        }
    }
}

/// Owns the capture-ingest thread and the aggregation worker threads.
/// Implements Drop so a dropped engine still signals its threads to stop.
pub struct CaptureEngine {
    /// Tells the ingest thread to stop reading.
    shutdown: Arc<AtomicBool>,
    /// Set once ingest has exited; workers then drain their lane and stop.
    ingest_done: Arc<AtomicBool>,
    ingest: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl CaptureEngine {
    /// Start ingesting from `source` with one aggregation worker per queue lane.
    pub fn start(
        source: Box<dyn PacketSource>,
        queue: Arc<IngestQueue>,
        aggregator: Arc<FlowAggregator>,
        stats: Arc<PipelineStats>,
    ) -> anyhow::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let ingest_done = Arc::new(AtomicBool::new(false));
        let mut engine = Self {
            shutdown: Arc::clone(&shutdown),
            ingest_done: Arc::clone(&ingest_done),
            ingest: None,
            workers: Vec::with_capacity(queue.lanes()),
        };

        // On a spawn failure `engine` drops here, which stops the threads already running.
        for lane in 0..queue.lanes() {
            let rx = queue.receiver(lane);
            let aggregator = Arc::clone(&aggregator);
            let done = Arc::clone(&ingest_done);
            let handle = std::thread::Builder::new()
                .name(format!("aggregate-{lane}"))
                .spawn(move || run_aggregation_worker(rx, aggregator, done))?;
            engine.workers.push(handle);
        }

        let handle = std::thread::Builder::new()
            .name("capture-ingest".into())
            .spawn(move || run_ingest_loop(source, queue, stats, shutdown))?;
        engine.ingest = Some(handle);

        tracing::info!("CaptureEngine started with {} aggregation workers", engine.workers.len());
        Ok(engine)
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop and wait for every thread.
    ///
    /// Ingest is joined first so nothing is pushed after the workers are told
    /// to finish; workers then drain whatever is still queued.
    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.ingest.take() {
            if handle.join().is_err() {
                tracing::error!("capture ingest thread panicked during shutdown");
            }
        }
        self.ingest_done.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("aggregation worker panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if self.ingest.is_some() || !self.workers.is_empty() {
            tracing::warn!("CaptureEngine dropped without join, signalling threads to stop");
        }
        self.shutdown.store(true, Ordering::Release);
        self.ingest_done.store(true, Ordering::Release);
    }
}

/// Main ingest loop running in a dedicated OS thread.
///
/// Faults from the source are counted and retried with exponential backoff;
/// the loop only ends on shutdown or when the source is exhausted.
pub fn run_ingest_loop(
    mut source: Box<dyn PacketSource>,
    queue: Arc<IngestQueue>,
    stats: Arc<PipelineStats>,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    while !shutdown.load(Ordering::Acquire) {
        match source.next_event() {
            Ok(SourceEvent::Packet(raw)) => {
                backoff = INITIAL_BACKOFF;
                stats.record_packet();
                match parse_packet(&raw) {
                    Ok(event) => {
                        stats.record_flow_event();
                        queue.push(event);
                    }
                    Err(e) => {
                        stats.record_parse_error();
                        tracing::trace!("dropped packet: {e}");
                    }
                }
            }
            Ok(SourceEvent::Idle) => {}
            Ok(SourceEvent::Exhausted) => {
                tracing::info!("capture source exhausted, ingest stopping");
                break;
            }
            Err(e) => {
                stats.record_capture_fault(&e, Utc::now());
                tracing::warn!("capture fault: {e}; retrying in {backoff:?}");
                sleep_unless_shutdown(backoff, &shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    tracing::info!("capture ingest stopped");
}

/// Aggregation worker: applies events from one lane in arrival order.
///
/// Exits only after ingest has finished and the lane is empty.
fn run_aggregation_worker(
    rx: Receiver<FlowEvent>,
    aggregator: Arc<FlowAggregator>,
    ingest_done: Arc<AtomicBool>,
) {
    loop {
        match rx.recv_timeout(WORKER_POLL) {
            Ok(event) => aggregator.apply(&event),
            Err(RecvTimeoutError::Timeout) => {
                if ingest_done.load(Ordering::Acquire) {
                    // Pushed between the timeout and the flag check.
                    while let Ok(event) = rx.try_recv() {
                        aggregator.apply(&event);
                    }
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Sleep in short slices so a pending shutdown is not delayed by a long backoff.
fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TalkerWindow;
    use crate::core::device::DeviceTable;
    use crate::core::gate::StateGate;
    use crate::error::Error;
    use etherparse::PacketBuilder;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    const SRC_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];
    const DST_MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x02];

    fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4(src, dst, 64)
            .tcp(sport, dport, 1, 64_000);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn udp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4(src, dst, 64)
            .udp(sport, dport);
        let payload = [0u8; 12];
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, &payload).unwrap();
        frame
    }

    #[test]
    fn test_parse_tcp_over_ethernet() {
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 51000, 443, b"hello");
        let raw = RawPacket::ethernet(Utc::now(), frame.clone());

        let event = parse_packet(&raw).unwrap();
        assert_eq!(event.protocol, Protocol::Tcp);
        assert_eq!(event.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(event.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(event.src_port, 51000);
        assert_eq!(event.dst_port, 443);
        assert_eq!(event.length, frame.len() as u64);
        assert_eq!(event.timestamp, raw.timestamp);
    }

    #[test]
    fn test_parse_udp_over_ethernet() {
        let raw = RawPacket::ethernet(Utc::now(), udp_frame([192, 168, 1, 5], [8, 8, 8, 8], 5353, 53));
        let event = parse_packet(&raw).unwrap();
        assert_eq!(event.protocol, Protocol::Udp);
        assert_eq!(event.src_port, 5353);
        assert_eq!(event.dst_port, 53);
    }

    #[test]
    fn test_parse_icmp_reports_zero_ports() {
        let builder = PacketBuilder::ethernet2(SRC_MAC, DST_MAC)
            .ipv4([10, 0, 0, 1], [1, 1, 1, 1], 64)
            .icmpv4_echo_request(7, 1);
        let mut frame = Vec::new();
        builder.write(&mut frame, &[0u8; 8]).unwrap();

        let event = parse_packet(&RawPacket::ethernet(Utc::now(), frame)).unwrap();
        assert_eq!(event.protocol, Protocol::Icmp);
        assert_eq!((event.src_port, event.dst_port), (0, 0));
    }

    #[test]
    fn test_parse_raw_ipv6_udp() {
        let src = [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst = [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let builder = PacketBuilder::ipv6(src, dst, 64).udp(546, 547);
        let mut packet = Vec::new();
        builder.write(&mut packet, &[1, 2, 3]).unwrap();

        let event = parse_packet(&RawPacket::raw_ip(Utc::now(), packet)).unwrap();
        assert_eq!(event.protocol, Protocol::Udp);
        assert!(event.src.is_ipv6());
        assert_eq!(event.dst_port, 547);
    }

    #[test]
    fn test_wire_len_overrides_captured_len() {
        let mut raw = RawPacket::ethernet(Utc::now(), tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, b""));
        raw.wire_len = 1514;
        assert_eq!(parse_packet(&raw).unwrap().length, 1514);
    }

    #[test]
    fn test_parse_snaplen_truncated_payload_keeps_wire_len() {
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 50000, 443, &[7u8; 1400]);
        let full_len = frame.len() as u64;
        let mut raw = RawPacket::ethernet(Utc::now(), frame);
        // Headers intact, payload cut after 100 bytes.
        raw.data.truncate(14 + 20 + 20 + 100);
        raw.wire_len = full_len;

        let event = parse_packet(&raw).unwrap();
        assert_eq!(event.protocol, Protocol::Tcp);
        assert_eq!((event.src_port, event.dst_port), (50000, 443));
        assert_eq!(event.length, full_len);
    }

    #[test]
    fn test_parse_truncated_frame_is_malformed() {
        let raw = RawPacket::ethernet(Utc::now(), vec![0u8; 10]);
        assert!(matches!(parse_packet(&raw), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_parse_truncated_transport_is_malformed() {
        let mut frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1000, 80, b"");
        // Cut into the 20-byte TCP header.
        frame.truncate(14 + 20 + 8);
        let raw = RawPacket::ethernet(Utc::now(), frame);
        assert!(matches!(parse_packet(&raw), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_parse_arp_is_not_ip() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&DST_MAC);
        frame.extend_from_slice(&SRC_MAC);
        frame.extend_from_slice(&[0x08, 0x06]);
        // hardware type, protocol type, sizes, opcode (reply)
        frame.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x02]);
        frame.extend_from_slice(&SRC_MAC);
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&DST_MAC);
        frame.extend_from_slice(&[10, 0, 0, 2]);

        let raw = RawPacket::ethernet(Utc::now(), frame);
        assert_eq!(parse_packet(&raw), Err(ParseError::NotIp));
    }

    #[test]
    fn test_protocol_display_matches_tags() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Other.to_string(), "Other");
        assert_eq!(serde_json::to_value(Protocol::Udp).unwrap(), "UDP");
    }

    fn pipeline(workers: usize, lane_capacity: usize) -> (Arc<IngestQueue>, Arc<FlowAggregator>, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::default());
        let gate = Arc::new(StateGate::new());
        let devices = Arc::new(DeviceTable::new(TalkerWindow::AllTime));
        let aggregator = Arc::new(FlowAggregator::new(devices, gate, chrono::Duration::seconds(120)));
        let queue = Arc::new(IngestQueue::new(workers, lane_capacity, Arc::clone(&stats)));
        (queue, aggregator, stats)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_engine_ingests_until_source_exhausted() {
        let (queue, aggregator, stats) = pipeline(2, 1024);
        let now = Utc::now();
        let mut packets: Vec<Result<RawPacket>> = (0..20)
            .map(|i| Ok(RawPacket::ethernet(now, tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000 + (i % 4), 443, b"x"))))
            .collect();
        packets.push(Ok(RawPacket::ethernet(now, vec![0u8; 4])));

        let engine = CaptureEngine::start(
            Box::new(IterSource::new(packets.into_iter())),
            queue,
            Arc::clone(&aggregator),
            Arc::clone(&stats),
        )
        .unwrap();

        wait_for(|| aggregator.total_packets() == 20);
        engine.join();

        let counters = stats.counters();
        assert_eq!(counters.packets_seen, 21);
        assert_eq!(counters.flow_events, 20);
        assert_eq!(counters.parse_errors, 1);
        assert_eq!(aggregator.connection_count(), 4);
    }

    /// Blocks like a live capture read, then yields one packet.
    struct SlowSource {
        delay: Duration,
        packet: Option<RawPacket>,
    }

    impl PacketSource for SlowSource {
        fn next_event(&mut self) -> Result<SourceEvent> {
            match self.packet.take() {
                Some(packet) => {
                    std::thread::sleep(self.delay);
                    Ok(SourceEvent::Packet(packet))
                }
                None => Ok(SourceEvent::Idle),
            }
        }
    }

    #[test]
    fn test_join_applies_packet_read_during_shutdown() {
        let (queue, aggregator, stats) = pipeline(2, 64);
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, 80, b"late");
        let source = SlowSource {
            delay: Duration::from_millis(400),
            packet: Some(RawPacket::ethernet(Utc::now(), frame)),
        };

        let engine = CaptureEngine::start(
            Box::new(source),
            Arc::clone(&queue),
            Arc::clone(&aggregator),
            Arc::clone(&stats),
        )
        .unwrap();

        // Workers see several idle polls while the read is still blocked.
        std::thread::sleep(Duration::from_millis(50));
        engine.join();

        let counters = stats.counters();
        assert_eq!(counters.flow_events, 1);
        assert_eq!(counters.queue_overflows, 0);
        assert_eq!(aggregator.total_packets(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capture_fault_is_counted_and_retried() {
        let (queue, aggregator, stats) = pipeline(1, 64);
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, 80, b"abc");
        let packets: Vec<Result<RawPacket>> = vec![
            Err(Error::Capture("interface reset".into())),
            Ok(RawPacket::ethernet(Utc::now(), frame)),
        ];

        let engine = CaptureEngine::start(
            Box::new(IterSource::new(packets.into_iter())),
            queue,
            Arc::clone(&aggregator),
            Arc::clone(&stats),
        )
        .unwrap();

        wait_for(|| aggregator.total_packets() == 1);
        engine.join();

        let counters = stats.counters();
        assert_eq!(counters.capture_faults, 1);
        let fault = counters.last_fault.expect("fault recorded");
        assert_eq!(fault.kind, "Capture");
        assert_eq!(fault.message, "interface reset");
    }
}
