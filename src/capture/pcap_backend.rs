//! Live capture through libpcap.

use chrono::{DateTime, Utc};
use pcap::{Active, Capture, Device, Linktype};

use super::{LinkType, PacketSource, RawPacket, SourceEvent};
use crate::error::{Error, Result};

/// Read timeout so the ingest thread can observe shutdown while the link is quiet.
const READ_TIMEOUT_MS: i32 = 500;

const SNAPLEN: i32 = 65_535;

impl From<pcap::Error> for Error {
    fn from(err: pcap::Error) -> Self {
        Error::Capture(err.to_string())
    }
}

pub struct PcapSource {
    capture: Capture<Active>,
    link: LinkType,
}

impl PcapSource {
    /// Open `interface` (or the default capture device) in promiscuous mode.
    pub fn open(interface: Option<&str>) -> Result<Self> {
        let device = match interface {
            Some(name) => Device::from(name),
            None => Device::lookup()?
                .ok_or_else(|| Error::Capture("no capture device available".into()))?,
        };
        let name = device.name.clone();

        let capture = Capture::from_device(device)?
            .promisc(true)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .immediate_mode(true)
            .open()?;

        let link = match capture.get_datalink() {
            Linktype::ETHERNET => LinkType::Ethernet,
            // DLT_RAW and its IPv4/IPv6 specific variants.
            Linktype(12) | Linktype(101) | Linktype(228) | Linktype(229) => LinkType::RawIp,
            other => {
                return Err(Error::Capture(format!(
                    "unsupported link type {} on {name}",
                    other.0
                )))
            }
        };

        tracing::info!("Capturing on {name} ({link:?})");
        Ok(Self { capture, link })
    }
}

impl PacketSource for PcapSource {
    fn next_event(&mut self) -> Result<SourceEvent> {
        match self.capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = DateTime::from_timestamp(ts.tv_sec as i64, (ts.tv_usec as u32) * 1000)
                    .unwrap_or_else(Utc::now);
                Ok(SourceEvent::Packet(RawPacket {
                    timestamp,
                    data: packet.data.to_vec(),
                    wire_len: packet.header.len as u64,
                    link: self.link,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(SourceEvent::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(SourceEvent::Exhausted),
            Err(e) => Err(e.into()),
        }
    }
}
