//! Weighted round robin.
//!
//! Same rank progression as round robin, except a flow only moves to its next round every
//! `weight`-th packet; the packets in between reuse the flow's previous rank and therefore leave
//! back-to-back within one round.

use super::round_robin::RoundState;
use crate::config::WeightConfig;
use crate::packet::{FlowId, Metadata, NodeId, Packet, Rank};
use std::collections::HashMap;

#[derive(Debug)]
pub struct WeightedRoundRobin {
    weights: WeightConfig,
    state: RoundState,
    /// Packets ranked in the flow's current round.
    served: HashMap<FlowId, u32>,
    leaf: NodeId,
}

impl WeightedRoundRobin {
    pub fn new(weights: WeightConfig, leaf: NodeId) -> Self {
        Self {
            weights,
            state: RoundState::default(),
            served: HashMap::new(),
            leaf,
        }
    }

    pub fn last_rank(&self, flow: FlowId) -> Option<Rank> {
        self.state.last_rank(flow)
    }

    pub(crate) fn rank(&mut self, packet: &Packet, meta: &mut Metadata) {
        let flow = packet.flow_id();
        let weight = self.weights.weight_of(flow);
        let rank = match self.state.last_rank(flow) {
            None => {
                self.served.insert(flow, 1);
                self.state.admit(flow)
            }
            Some(last) => {
                let served = self.served.entry(flow).or_insert(0);
                if *served >= weight {
                    *served = 1;
                    self.state.advance(flow, last)
                } else {
                    *served += 1;
                    last
                }
            }
        };
        meta.ranks = vec![rank];
        meta.leaf_node = self.leaf;
    }
}
