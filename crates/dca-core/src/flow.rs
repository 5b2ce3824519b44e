//! Flow aggregation and packet capture (see spec §3 and §4.1).
//!
//! Packets are grouped into bidirectional flows keyed by the `sip:sport-dip:dport`
//! string of whichever endpoint sent the first packet of the conversation;
//! later packets from either direction are folded into that same flow.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use pcap::{Active, Capture, Device};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DcaError;
use crate::types::{FeatureVector, Protocol};

/// A single parsed packet's relevant fields, independent of flow state.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    /// On-wire size (the full captured frame length).
    pub wire_size: u64,
    /// Payload length, i.e. the TCP/UDP segment past the transport header.
    pub payload_len: u64,
}

/// A bidirectional flow, aggregated from both directions of a conversation.
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: String,
    pub sip: IpAddr,
    pub sport: u16,
    pub dip: IpAddr,
    pub dport: u16,
    pub proto: Protocol,
    pub spkts: u64,
    pub dpkts: u64,
    /// Payload bytes observed in each direction.
    pub sbytes: u64,
    pub dbytes: u64,
    /// On-wire bytes observed in each direction (feeds `smean`/`dmean`).
    pub spkts_size: u64,
    pub dpkts_size: u64,
}

impl Flow {
    fn new(key: String, packet: &ParsedPacket) -> Self {
        Self {
            key,
            sip: packet.src_ip,
            sport: packet.src_port,
            dip: packet.dst_ip,
            dport: packet.dst_port,
            proto: packet.protocol,
            spkts: 0,
            dpkts: 0,
            sbytes: 0,
            dbytes: 0,
            spkts_size: 0,
            dpkts_size: 0,
        }
    }

    /// Folds one more packet into this flow, crediting the source or
    /// destination counters depending on which endpoint it matches.
    fn update(&mut self, packet: &ParsedPacket) {
        if packet.src_ip == self.sip && packet.src_port == self.sport {
            self.spkts += 1;
            self.sbytes += packet.payload_len;
            self.spkts_size += packet.wire_size;
        } else {
            self.dpkts += 1;
            self.dbytes += packet.payload_len;
            self.dpkts_size += packet.wire_size;
        }
    }

    /// Mean on-wire size in the src direction (`spkts_size / spkts`).
    fn smean(&self) -> f64 {
        if self.spkts == 0 {
            0.0
        } else {
            self.spkts_size as f64 / self.spkts as f64
        }
    }

    /// Mean on-wire size in the dst direction (`dpkts_size / dpkts`).
    fn dmean(&self) -> f64 {
        if self.dpkts == 0 {
            0.0
        } else {
            self.dpkts_size as f64 / self.dpkts as f64
        }
    }

    /// Builds the fixed 8-component feature vector in scaler order.
    pub fn feature_vector(&self) -> FeatureVector {
        let is_tcp = if matches!(self.proto, Protocol::Tcp) { 1.0 } else { 0.0 };
        let is_udp = if matches!(self.proto, Protocol::Udp) { 1.0 } else { 0.0 };
        [
            self.spkts as f64,
            self.dpkts as f64,
            self.sbytes as f64,
            self.dbytes as f64,
            self.smean(),
            self.dmean(),
            is_tcp,
            is_udp,
        ]
    }
}

fn forward_key(packet: &ParsedPacket) -> String {
    format!(
        "{}:{}-{}:{}",
        packet.src_ip, packet.src_port, packet.dst_ip, packet.dst_port
    )
}

fn reverse_key(packet: &ParsedPacket) -> String {
    format!(
        "{}:{}-{}:{}",
        packet.dst_ip, packet.dst_port, packet.src_ip, packet.src_port
    )
}

/// In-memory table of in-progress flows. Single-threaded: owned exclusively
/// by the Collector task, never shared across threads.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<String, Flow>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self { flows: HashMap::new() }
    }

    /// Only TCP/UDP packets are accepted into the table; everything else is
    /// dropped before a `Flow` is ever built (spec §4.1's acceptance rule).
    fn accepts(packet: &ParsedPacket) -> bool {
        matches!(packet.protocol, Protocol::Tcp | Protocol::Udp)
    }

    /// Folds `packet` into its flow, creating one if neither orientation has
    /// been seen yet. Returns the flow's key so the caller can look it up
    /// again for antigen sampling — but only on the *update* path. Per spec
    /// §4.3, emission happens "on every update (but not on new-flow
    /// creation)", so the very first packet of a flow returns `None` here
    /// (matching `networkcapture.py`'s `process_packet`, whose `stdout.put`
    /// lives only in the `if flow_id != None` branch).
    pub fn ingest(&mut self, packet: &ParsedPacket) -> Option<&str> {
        if !Self::accepts(packet) {
            return None;
        }

        let fwd = forward_key(packet);
        if self.flows.contains_key(&fwd) {
            let flow = self.flows.get_mut(&fwd).unwrap();
            flow.update(packet);
            return Some(&self.flows.get(&fwd).unwrap().key);
        }

        let rev = reverse_key(packet);
        if self.flows.contains_key(&rev) {
            let flow = self.flows.get_mut(&rev).unwrap();
            flow.update(packet);
            return Some(&self.flows.get(&rev).unwrap().key);
        }

        let mut flow = Flow::new(fwd.clone(), packet);
        flow.update(packet);
        self.flows.insert(fwd.clone(), flow);
        None
    }

    pub fn get(&self, key: &str) -> Option<&Flow> {
        self.flows.get(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Live packet capture on a single interface, handed to the pipeline as the
/// Collector stage's packet source.
pub struct PacketCollector {
    capture: Capture<Active>,
}

impl PacketCollector {
    /// Opens `interface` with a BPF filter scoped to `host_addr`, failing
    /// loudly if the interface doesn't exist — unlike the original capture
    /// tooling this is adapted from, there is no best-effort fallback to
    /// another adapter.
    pub fn open(interface: &str, bpf_filter: &str) -> Result<Self, DcaError> {
        let devices = Device::list()
            .map_err(|e| DcaError::Startup(format!("cannot enumerate devices: {e}")))?;
        let device = devices
            .into_iter()
            .find(|d| d.name == interface)
            .ok_or_else(|| DcaError::Startup(format!("interface '{interface}' not found")))?;

        let mut capture = Capture::from_device(device)
            .map_err(|e| DcaError::Capture(format!("cannot open interface: {e}")))?
            .promisc(false)
            .snaplen(1518)
            .timeout(10)
            .buffer_size(2 * 1024 * 1024)
            .open()
            .map_err(|e| DcaError::Capture(format!("cannot start capture: {e}")))?;

        capture
            .filter(bpf_filter, true)
            .map_err(|e| DcaError::Startup(format!("invalid BPF filter '{bpf_filter}': {e}")))?;

        let capture = capture
            .setnonblock()
            .map_err(|e| DcaError::Capture(format!("cannot set non-blocking mode: {e}")))?;

        info!(interface, bpf_filter, "capture started");
        Ok(Self { capture })
    }

    /// Runs the capture loop, folding packets into `table` and forwarding
    /// each touched flow's antigen id and feature vector to `antigen_tx`.
    /// Exits when `cancel` fires.
    pub async fn run(
        mut self,
        mut table: FlowTable,
        antigen_tx: mpsc::Sender<Option<(String, FeatureVector)>>,
        cancel: CancellationToken,
    ) -> Result<(), DcaError> {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.capture.next_packet() {
                Ok(raw) => {
                    if let Some(packet) = parse_packet(raw.data) {
                        if let Some(key) = table.ingest(&packet) {
                            let key = key.to_string();
                            let features = table.get(&key).expect("just inserted").feature_vector();
                            if antigen_tx.send(Some((key, features))).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(pcap::Error::TimeoutExpired) => {
                    tokio::time::sleep(Duration::from_micros(100)).await;
                }
                Err(e) => {
                    warn!(error = %e, "capture error");
                }
            }
        }

        debug!(flows = table.len(), "collector stopping");
        let _ = antigen_tx.send(None).await;
        Ok(())
    }
}

fn parse_packet(data: &[u8]) -> Option<ParsedPacket> {
    let ethernet = EthernetPacket::new(data)?;
    let wire_size = data.len() as u64;
    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => parse_ipv4(ethernet.payload(), wire_size),
        EtherTypes::Ipv6 => parse_ipv6(ethernet.payload(), wire_size),
        _ => None,
    }
}

fn parse_ipv4(data: &[u8], wire_size: u64) -> Option<ParsedPacket> {
    let ipv4 = Ipv4Packet::new(data)?;
    let src_ip = IpAddr::V4(ipv4.get_source());
    let dst_ip = IpAddr::V4(ipv4.get_destination());

    match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv4.payload())?;
            Some(ParsedPacket {
                src_ip,
                dst_ip,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                protocol: Protocol::Tcp,
                wire_size,
                payload_len: tcp.payload().len() as u64,
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv4.payload())?;
            Some(ParsedPacket {
                src_ip,
                dst_ip,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                protocol: Protocol::Udp,
                wire_size,
                payload_len: udp.payload().len() as u64,
            })
        }
        IpNextHeaderProtocols::Icmp => Some(ParsedPacket {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            protocol: Protocol::Icmp,
            wire_size,
            payload_len: ipv4.payload().len() as u64,
        }),
        other => Some(ParsedPacket {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            protocol: Protocol::Other(other.0),
            wire_size,
            payload_len: ipv4.payload().len() as u64,
        }),
    }
}

fn parse_ipv6(data: &[u8], wire_size: u64) -> Option<ParsedPacket> {
    let ipv6 = Ipv6Packet::new(data)?;
    let src_ip = IpAddr::V6(ipv6.get_source());
    let dst_ip = IpAddr::V6(ipv6.get_destination());

    match ipv6.get_next_header() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv6.payload())?;
            Some(ParsedPacket {
                src_ip,
                dst_ip,
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
                protocol: Protocol::Tcp,
                wire_size,
                payload_len: tcp.payload().len() as u64,
            })
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv6.payload())?;
            Some(ParsedPacket {
                src_ip,
                dst_ip,
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
                protocol: Protocol::Udp,
                wire_size,
                payload_len: udp.payload().len() as u64,
            })
        }
        IpNextHeaderProtocols::Icmpv6 => Some(ParsedPacket {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            protocol: Protocol::Icmp,
            wire_size,
            payload_len: ipv6.payload().len() as u64,
        }),
        other => Some(ParsedPacket {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            protocol: Protocol::Other(other.0),
            wire_size,
            payload_len: ipv6.payload().len() as u64,
        }),
    }
}
