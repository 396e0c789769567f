//! Switch: ingress → scheduling tree → egress.
//!
//! Wiring:
//!
//! ```text
//!  pkt_in ──► Ingress ══ready/data══► SchedulingTree ══ready/data══► Egress ══ready/data══► pkt_out
//!               │  ▲                                                   │  ▲
//!   rank_trace ◄┘  └──────────────── SharedVirtualTime ◄──────────────┘  └── start_dequeue
//! ```
//!
//! Every double edge is a handshake link: the consumer grants a ready token, the producer pushes
//! exactly one item per token. The virtual-time state belongs to this switch alone.

use crate::clock::Clock;
use crate::config::{SchedAlg, SwitchConfig};
use crate::egress::Egress;
use crate::error::{ConfigError, SimError};
use crate::ingress::{Ingress, RankRecord};
use crate::packet::{Metadata, NodeId, Packet};
use crate::pifo::PifoTiming;
use crate::pipe::{link, ConsumerEnd, Pipe};
use crate::scheduler::RankEngine;
use crate::sim::{Activity, Process, Shutdown};
use crate::tree::SchedulingTree;
use crate::virtual_time::SharedVirtualTime;
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use tracing::info;

/// Ends of the switch that the surrounding test bench holds.
pub struct SwitchIo {
    /// Arriving `(metadata, packet)` pairs.
    pub pkt_in: Sender<(Metadata, Packet)>,
    /// Departing pairs; grant a ready token per packet wanted.
    pub pkt_out: ConsumerEnd<(Metadata, Packet)>,
    /// Send once to let egress start draining the tree.
    pub start_dequeue: Sender<()>,
    /// Level-0 rank of every packet, in ranking order.
    pub rank_trace: Receiver<RankRecord>,
}

pub struct Switch {
    ingress: Ingress,
    tree: SchedulingTree,
    egress: Egress,
    virtual_time: SharedVirtualTime,
    kind: SchedAlg,
}

impl Switch {
    /// Build a switch from `config`. Nothing in `config` is consulted after this returns.
    pub fn new(config: &SwitchConfig, shutdown: Shutdown) -> Result<(Self, SwitchIo), ConfigError> {
        config.validate()?;
        let virtual_time = SharedVirtualTime::for_algorithm(&config.algorithm);
        let engine = RankEngine::new(&config.algorithm, &config.shape, virtual_time.clone())?;
        let kind = engine.kind();

        let (pkt_in, ingress_rx) = Pipe::new().split();
        let (rank_tx, rank_trace) = Pipe::new().split();
        let (start_dequeue, start_rx) = Pipe::new().split();
        let (ingress_to_tree, tree_from_ingress) = link();
        let (tree_to_egress, egress_from_tree) = link();
        let (egress_out, pkt_out) = link();

        let timing = PifoTiming {
            write_latency: config.write_latency,
            read_latency: config.read_latency,
        };
        let tree = SchedulingTree::new(
            &config.shape,
            config.max_node_size,
            timing,
            shutdown.clone(),
            tree_from_ingress,
            tree_to_egress,
        )?;
        let ingress = Ingress::new(engine, ingress_rx, ingress_to_tree, shutdown.clone())
            .with_rank_trace(rank_tx);
        let egress = Egress::new(
            egress_from_tree,
            egress_out,
            start_rx,
            virtual_time.clone(),
            shutdown,
        );

        info!(
            algorithm = %kind,
            tree = %tree,
            max_node_size = ?config.max_node_size,
            "switch built"
        );

        let switch = Switch {
            ingress,
            tree,
            egress,
            virtual_time,
            kind,
        };
        let io = SwitchIo {
            pkt_in,
            pkt_out,
            start_dequeue,
            rank_trace,
        };
        Ok((switch, io))
    }

    pub fn kind(&self) -> SchedAlg {
        self.kind
    }

    pub fn tree(&self) -> &SchedulingTree {
        &self.tree
    }

    pub fn ingress(&self) -> &Ingress {
        &self.ingress
    }

    pub fn egress(&self) -> &Egress {
        &self.egress
    }

    pub fn virtual_time(&self) -> &SharedVirtualTime {
        &self.virtual_time
    }

    /// Evictions per node.
    pub fn drop_counts(&self) -> BTreeMap<NodeId, u64> {
        self.tree.drop_counts()
    }
}

impl Process for Switch {
    fn name(&self) -> &'static str {
        "switch"
    }

    /// Ingress, then the tree (writer, reader, nodes), then egress.
    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = self.ingress.step(clock)?;
        activity |= self.tree.step(clock)?;
        activity |= self.egress.step(clock)?;
        Ok(activity)
    }

    fn busy(&self) -> bool {
        self.ingress.busy() || self.tree.busy() || self.egress.busy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlgorithmConfig, TreeShape};
    use crate::packet::FiveTuple;
    use crate::pipe::Recv;
    use crate::sim::Simulator;

    fn send(io: &SwitchIo, id: u64, flow: u16) {
        let packet = Packet::filled(id, FiveTuple::tcp(flow, 80), 10);
        let meta = Metadata::for_packet(&packet, 1, 4);
        io.pkt_in.send((meta, packet)).unwrap();
    }

    fn drain(sim: &mut Simulator, switch: &mut Switch, io: &SwitchIo, n: usize) -> Vec<u64> {
        let mut out = Vec::new();
        for _ in 0..n {
            assert!(io.pkt_out.grant());
            loop {
                sim.step_cycle(switch).unwrap();
                if let Recv::Item((_, packet)) = io.pkt_out.poll_data() {
                    out.push(packet.id);
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn invert_releases_packets_in_reverse() {
        let shutdown = Shutdown::new();
        let config = SwitchConfig::new(AlgorithmConfig::Invert { max_rank: 100 });
        let (mut switch, io) = Switch::new(&config, shutdown.clone()).unwrap();
        let mut sim = Simulator::new(1, shutdown).with_cycle_limit(1_000);

        for id in 0..10 {
            send(&io, id, 0);
        }
        sim.run_for(&mut switch, 40).unwrap();
        assert_eq!(switch.tree().len_of(0), Some(10));

        io.start_dequeue.send(()).unwrap();
        let order = drain(&mut sim, &mut switch, &io, 10);
        assert_eq!(order, (0..10).rev().collect::<Vec<_>>());

        let ranks: Vec<i64> = io.rank_trace.try_iter().map(|record| record.rank).collect();
        assert_eq!(ranks, (91..=100).rev().collect::<Vec<_>>());
    }

    #[test]
    fn shape_mismatch_fails_construction() {
        let config = SwitchConfig::new(AlgorithmConfig::Strict)
            .with_shape(TreeShape::two_level(0, [1, 2]));
        assert!(matches!(
            Switch::new(&config, Shutdown::new()),
            Err(ConfigError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn bounded_switch_reports_drops() {
        let shutdown = Shutdown::new();
        let config =
            SwitchConfig::new(AlgorithmConfig::Strict).with_max_node_size(Some(4));
        let (mut switch, io) = Switch::new(&config, shutdown.clone()).unwrap();
        let mut sim = Simulator::new(1, shutdown);
        for id in 0..6 {
            send(&io, id, id as u16);
        }
        sim.run_for(&mut switch, 30).unwrap();
        assert_eq!(switch.drop_counts()[&0], 2);

        io.start_dequeue.send(()).unwrap();
        assert_eq!(drain(&mut sim, &mut switch, &io, 4), vec![0, 1, 2, 3]);
    }

    #[test]
    fn instances_do_not_share_virtual_time() {
        let config = SwitchConfig::new(AlgorithmConfig::default_for(SchedAlg::Stfq));
        let (a, _) = Switch::new(&config, Shutdown::new()).unwrap();
        let (b, _) = Switch::new(&config, Shutdown::new()).unwrap();
        a.virtual_time()
            .apply(&crate::packet::SchedMeta::Stfq { start: 5 });
        assert_eq!(a.virtual_time().flat(), 5);
        assert_eq!(b.virtual_time().flat(), 0);
    }
}
