//! Packet and metadata representation shared by all pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Sortable priority assigned per tree level. Lower values dequeue first.
pub type Rank = i64;

/// Identity of a PIFO node, taken from the tree shape descriptor.
pub type NodeId = u32;

/// Flow identifier used by every per-flow discipline (the TCP/UDP source port).
pub type FlowId = u16;

/// Ethernet + IPv4 + TCP header bytes that precede the payload on the wire.
pub const HEADER_BYTES: usize = 14 + 20 + 20;

/// Standard Ethernet MTU plus the Ethernet header; payloads are clipped to fit.
pub const MAX_PACKET_SIZE: usize = 1514;

/// Classic 5-tuple flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FiveTuple {
    /// TCP tuple between two fixed test hosts, distinguished by source port only.
    pub fn tcp(src_port: u16, dst_port: u16) -> Self {
        Self {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            proto: 6,
            src_port,
            dst_port,
        }
    }
}

/// Immutable unit of work travelling through the switch.
///
/// A packet is moved, never shared: whichever stage holds it owns it. Only the header fields the
/// schedulers look at are modelled; the payload is opaque filler that gives the packet its length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Per-run identifier (the IP `id` field in captures).
    pub id: u64,
    pub tuple: FiveTuple,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(id: u64, tuple: FiveTuple, payload: &[u8]) -> Packet {
        let len = payload.len().min(MAX_PACKET_SIZE - HEADER_BYTES);
        Packet {
            id,
            tuple,
            payload: payload[..len].to_vec(),
        }
    }

    /// Packet with `payload_len` zero bytes of filler.
    pub fn filled(id: u64, tuple: FiveTuple, payload_len: usize) -> Packet {
        Packet::new(id, tuple, &vec![0u8; payload_len])
    }

    /// Same headers and payload under a new identifier.
    pub fn with_id(&self, id: u64) -> Packet {
        Packet {
            id,
            tuple: self.tuple,
            payload: self.payload.clone(),
        }
    }

    /// Flow key used by the per-flow disciplines.
    pub fn flow_id(&self) -> FlowId {
        self.tuple.src_port
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length on the wire, headers included.
    pub fn len(&self) -> usize {
        HEADER_BYTES + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Algorithm-specific scratch fields written by ingress and read by egress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedMeta {
    #[default]
    None,
    Stfq {
        start: Rank,
    },
    Hstfq {
        class: u16,
        flow_start: Rank,
        class_start: Rank,
    },
    MinRate {
        under_min_rate: bool,
    },
}

impl fmt::Display for SchedMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedMeta::None => write!(f, "none"),
            SchedMeta::Stfq { start } => write!(f, "start = {start}"),
            SchedMeta::Hstfq {
                class,
                flow_start,
                class_start,
            } => write!(
                f,
                "class = {class}, flow_start = {flow_start}, class_start = {class_start}"
            ),
            SchedMeta::MinRate { under_min_rate } => write!(f, "under_min_rate = {under_min_rate}"),
        }
    }
}

/// Per-packet scheduling metadata, created at ingress and read-only once the tree emits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub pkt_len: usize,
    /// Switch ingress port bitmap.
    pub src_port: u8,
    /// Switch egress port bitmap.
    pub dst_port: u8,
    /// One rank per tree level, leaf first.
    pub ranks: Vec<Rank>,
    /// PIFO leaf the packet is first inserted into.
    pub leaf_node: NodeId,
    pub sched_meta: SchedMeta,
}

impl Metadata {
    /// Fresh metadata for `packet` entering on `src_port` and leaving on `dst_port`.
    ///
    /// Ranks and the leaf selector are placeholders until the rank engine fills them in.
    pub fn for_packet(packet: &Packet, src_port: u8, dst_port: u8) -> Self {
        Self {
            pkt_len: packet.len(),
            src_port,
            dst_port,
            ranks: Vec::new(),
            leaf_node: 0,
            sched_meta: SchedMeta::None,
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ pkt_len: {}, src_port: {:08b}, dst_port: {:08b}, ranks: {:?}, leaf_node: {}, sched_meta: {} }}",
            self.pkt_len, self.src_port, self.dst_port, self.ranks, self.leaf_node, self.sched_meta
        )
    }
}
