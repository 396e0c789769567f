//! Strict priority: the flow ID is the rank, so lower IDs always win.

use crate::packet::{Metadata, NodeId, Packet, Rank};

#[derive(Debug)]
pub struct Strict {
    leaf: NodeId,
}

impl Strict {
    pub fn new(leaf: NodeId) -> Self {
        Self { leaf }
    }

    pub(crate) fn rank(&mut self, packet: &Packet, meta: &mut Metadata) {
        meta.ranks = vec![Rank::from(packet.flow_id())];
        meta.leaf_node = self.leaf;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::packet;

    #[test]
    fn rank_is_the_flow_id() {
        let mut strict = Strict::new(0);
        for flow in [4, 0, 9] {
            let (pkt, mut meta) = packet(0, flow, 10);
            strict.rank(&pkt, &mut meta);
            assert_eq!(meta.ranks, vec![Rank::from(flow)]);
        }
    }
}
