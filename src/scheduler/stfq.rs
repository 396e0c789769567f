//! Start-Time Fair Queueing (STFQ), an approximation of weighted fair queueing.
//!
//! Algorithm:
//! 1. `start = max(virtual_time, last_finish[flow])` (just `virtual_time` for a new flow)
//! 2. `last_finish[flow] = start + len / weight[flow]`
//! 3. The packet is ranked by `start`, which egress later feeds back as the new virtual time
//!
//! Flows are keyed by the full 5-tuple; weights are looked up by flow ID.

use super::len_as_rank;
use crate::config::WeightConfig;
use crate::packet::{FiveTuple, Metadata, NodeId, Packet, Rank, SchedMeta};
use crate::virtual_time::SharedVirtualTime;
use std::collections::HashMap;

#[derive(Debug)]
pub struct Stfq {
    weights: WeightConfig,
    last_finish: HashMap<FiveTuple, Rank>,
    virtual_time: SharedVirtualTime,
    leaf: NodeId,
}

impl Stfq {
    pub fn new(weights: WeightConfig, leaf: NodeId, virtual_time: SharedVirtualTime) -> Self {
        Self {
            weights,
            last_finish: HashMap::new(),
            virtual_time,
            leaf,
        }
    }

    /// Virtual finish time of the flow's most recent packet.
    pub fn last_finish(&self, tuple: &FiveTuple) -> Option<Rank> {
        self.last_finish.get(tuple).copied()
    }

    pub(crate) fn rank(&mut self, packet: &Packet, meta: &mut Metadata) {
        let virtual_time = self.virtual_time.flat();
        let start = match self.last_finish.get(&packet.tuple) {
            Some(finish) => virtual_time.max(*finish),
            None => virtual_time,
        };
        let weight = Rank::from(self.weights.weight_of(packet.flow_id()));
        self.last_finish
            .insert(packet.tuple, start + len_as_rank(meta.pkt_len) / weight);

        meta.ranks = vec![start];
        meta.leaf_node = self.leaf;
        meta.sched_meta = SchedMeta::Stfq { start };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlgorithmConfig;
    use crate::scheduler::test_support::packet;
    use std::collections::BTreeMap;

    fn stfq(weights: &[(u16, u32)]) -> (Stfq, SharedVirtualTime) {
        let cfg = WeightConfig {
            weights: weights.iter().copied().collect::<BTreeMap<_, _>>(),
            default_weight: 1,
        };
        let vt = SharedVirtualTime::for_algorithm(&AlgorithmConfig::Stfq(cfg.clone()));
        (Stfq::new(cfg, 0, vt.clone()), vt)
    }

    fn start_of(stfq: &mut Stfq, flow: u16) -> Rank {
        let (pkt, mut meta) = packet(0, flow, 10);
        stfq.rank(&pkt, &mut meta);
        assert_eq!(meta.sched_meta, SchedMeta::Stfq { start: meta.ranks[0] });
        meta.ranks[0]
    }

    #[test]
    fn back_to_back_packets_advance_by_length() {
        let (mut stfq, _) = stfq(&[]);
        // 64-byte packets, weight 1.
        assert_eq!(start_of(&mut stfq, 1), 0);
        assert_eq!(start_of(&mut stfq, 1), 64);
        assert_eq!(start_of(&mut stfq, 1), 128);
        assert_eq!(start_of(&mut stfq, 2), 0);
    }

    #[test]
    fn weight_divides_the_finish_increment() {
        let (mut stfq, _) = stfq(&[(1, 2), (3, 3)]);
        start_of(&mut stfq, 1);
        assert_eq!(start_of(&mut stfq, 1), 32);
        start_of(&mut stfq, 3);
        // Integer division: 64 / 3 = 21.
        assert_eq!(start_of(&mut stfq, 3), 21);
    }

    #[test]
    fn idle_flow_restarts_at_virtual_time() {
        let (mut stfq, vt) = stfq(&[]);
        start_of(&mut stfq, 1);
        vt.apply(&SchedMeta::Stfq { start: 1000 });
        assert_eq!(start_of(&mut stfq, 1), 1000);
        assert_eq!(start_of(&mut stfq, 9), 1000);
    }

    #[test]
    fn backlogged_flow_is_not_pulled_back_by_virtual_time() {
        let (mut stfq, vt) = stfq(&[]);
        for _ in 0..5 {
            start_of(&mut stfq, 1);
        }
        vt.apply(&SchedMeta::Stfq { start: 64 });
        assert_eq!(start_of(&mut stfq, 1), 320);
    }
}
