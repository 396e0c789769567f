//! Round robin over flows.
//!
//! Algorithm:
//! 1. A flow seen for the first time is ranked one past the largest rank handed out so far and
//!    bumps the active-flow count.
//! 2. A known flow is ranked `last_rank + active_flows`, i.e. one full round after its previous
//!    packet.
//!
//! Flows are never forgotten, so the active-flow count only grows.

use crate::packet::{FlowId, Metadata, NodeId, Packet, Rank};
use std::collections::HashMap;

/// Rank bookkeeping shared by RR and WRR.
#[derive(Debug, Default)]
pub(crate) struct RoundState {
    last_rank: HashMap<FlowId, Rank>,
    max_rank: Rank,
    active_flows: Rank,
}

impl RoundState {
    /// Rank for a newly seen flow, registering it as active.
    pub(crate) fn admit(&mut self, flow: FlowId) -> Rank {
        self.active_flows += 1;
        let rank = self.max_rank + 1;
        self.record(flow, rank);
        rank
    }

    /// Move `flow` one round past its previous rank.
    pub(crate) fn advance(&mut self, flow: FlowId, last: Rank) -> Rank {
        let rank = last + self.active_flows;
        self.record(flow, rank);
        rank
    }

    pub(crate) fn last_rank(&self, flow: FlowId) -> Option<Rank> {
        self.last_rank.get(&flow).copied()
    }

    pub(crate) fn active_flows(&self) -> Rank {
        self.active_flows
    }

    fn record(&mut self, flow: FlowId, rank: Rank) {
        self.last_rank.insert(flow, rank);
        self.max_rank = self.max_rank.max(rank);
    }
}

#[derive(Debug)]
pub struct RoundRobin {
    state: RoundState,
    leaf: NodeId,
}

impl RoundRobin {
    pub fn new(leaf: NodeId) -> Self {
        Self {
            state: RoundState::default(),
            leaf,
        }
    }

    pub fn last_rank(&self, flow: FlowId) -> Option<Rank> {
        self.state.last_rank(flow)
    }

    pub fn active_flows(&self) -> Rank {
        self.state.active_flows()
    }

    pub(crate) fn rank(&mut self, packet: &Packet, meta: &mut Metadata) {
        let flow = packet.flow_id();
        let rank = match self.state.last_rank(flow) {
            Some(last) => self.state.advance(flow, last),
            None => self.state.admit(flow),
        };
        meta.ranks = vec![rank];
        meta.leaf_node = self.leaf;
    }
}
