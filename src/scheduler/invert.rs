//! Invert: strictly decreasing ranks, so a drained queue releases packets newest first.

use crate::packet::{Metadata, NodeId, Rank};

#[derive(Debug)]
pub struct Invert {
    max_rank: Rank,
    seen: Rank,
    leaf: NodeId,
}

impl Invert {
    pub fn new(max_rank: Rank, leaf: NodeId) -> Self {
        Self {
            max_rank,
            seen: 0,
            leaf,
        }
    }

    /// Packets ranked so far.
    pub fn seen(&self) -> Rank {
        self.seen
    }

    pub(crate) fn rank(&mut self, meta: &mut Metadata) {
        meta.ranks = vec![self.max_rank.saturating_sub(self.seen)];
        meta.leaf_node = self.leaf;
        self.seen += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::packet;

    #[test]
    fn ranks_count_down_from_max() {
        let mut invert = Invert::new(100, 0);
        let ranks: Vec<Rank> = (0..4)
            .map(|id| {
                let (_, mut meta) = packet(id, 0, 10);
                invert.rank(&mut meta);
                assert_eq!(meta.leaf_node, 0);
                meta.ranks[0]
            })
            .collect();
        assert_eq!(ranks, vec![100, 99, 98, 97]);
        assert_eq!(invert.seen(), 4);
    }
}
