//! Minimum-rate guarantee.
//!
//! Each flow with a configured minimum rate owns a token bucket that refills at that rate (bytes
//! per clock period) up to the burst allowance, starting full. A packet that fits in the bucket
//! consumes its length in tokens and goes to the under-rate leaf; anything else, including every
//! packet of a flow without a guarantee, goes to the over-rate leaf. The root ranks the under-rate
//! leaf ahead of the over-rate one, and both leaves are FIFO by arrival time.

use crate::clock::Clock;
use crate::config::MinRateConfig;
use crate::packet::{FlowId, Metadata, NodeId, Packet, Rank, SchedMeta};
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: u64,
}

#[derive(Debug)]
pub struct MinRate {
    cfg: MinRateConfig,
    buckets: HashMap<FlowId, Bucket>,
}

impl MinRate {
    /// Leaf holding traffic within its guaranteed rate.
    pub const UNDER_LEAF: NodeId = 1;
    /// Leaf holding everything else.
    pub const OVER_LEAF: NodeId = 2;

    pub fn new(cfg: MinRateConfig) -> Self {
        Self {
            cfg,
            buckets: HashMap::new(),
        }
    }

    /// Current bucket level of `flow`, if it has been seen.
    pub fn tokens(&self, flow: FlowId) -> Option<f64> {
        self.buckets.get(&flow).map(|bucket| bucket.tokens)
    }

    fn admit(&mut self, flow: FlowId, len: f64, now: u64) -> bool {
        let Some(rate) = self.cfg.min_rates.get(&flow).copied() else {
            return false;
        };
        let burst = self.cfg.burst_bytes;
        let bucket = self.buckets.entry(flow).or_insert(Bucket {
            tokens: burst,
            last_refill: now,
        });
        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        bucket.tokens = (bucket.tokens + rate * elapsed).min(burst);
        bucket.last_refill = now;
        if bucket.tokens >= len {
            bucket.tokens -= len;
            true
        } else {
            false
        }
    }

    pub(crate) fn rank(&mut self, packet: &Packet, meta: &mut Metadata, clock: &Clock) {
        let flow = packet.flow_id();
        let under_min_rate = self.admit(flow, meta.pkt_len as f64, clock.periods_elapsed());
        let arrival = Rank::try_from(clock.now()).unwrap_or(Rank::MAX);
        trace!(flow, under_min_rate, "min-rate classification");

        if under_min_rate {
            meta.ranks = vec![arrival, 0];
            meta.leaf_node = Self::UNDER_LEAF;
        } else {
            meta.ranks = vec![arrival, 1];
            meta.leaf_node = Self::OVER_LEAF;
        }
        meta.sched_meta = SchedMeta::MinRate { under_min_rate };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::packet;
    use std::collections::BTreeMap;

    fn min_rate(rates: &[(FlowId, f64)], burst: f64) -> MinRate {
        MinRate::new(MinRateConfig {
            min_rates: rates.iter().copied().collect::<BTreeMap<_, _>>(),
            burst_bytes: burst,
        })
    }

    fn classify(m: &mut MinRate, flow: FlowId, clock: &Clock) -> Metadata {
        let (pkt, mut meta) = packet(0, flow, 10);
        m.rank(&pkt, &mut meta, clock);
        meta
    }

    #[test]
    fn flow_within_its_rate_is_always_under() {
        // 64-byte packets every 100 periods against 1 byte/period.
        let mut m = min_rate(&[(0, 1.0)], 128.0);
        let mut clock = Clock::new(1);
        for _ in 0..50 {
            let meta = classify(&mut m, 0, &clock);
            assert_eq!(meta.leaf_node, MinRate::UNDER_LEAF);
            assert_eq!(meta.ranks, vec![clock.now() as Rank, 0]);
            for _ in 0..100 {
                clock.tick();
            }
        }
    }

    #[test]
    fn burst_above_rate_spills_to_over_leaf() {
        let mut m = min_rate(&[(0, 1.0)], 128.0);
        let clock = Clock::new(1);
        let leaves: Vec<NodeId> = (0..3).map(|_| classify(&mut m, 0, &clock).leaf_node).collect();
        assert_eq!(leaves, vec![1, 1, 2]);
        assert_eq!(m.tokens(0), Some(0.0));
    }

    #[test]
    fn refill_is_capped_at_the_burst() {
        let mut m = min_rate(&[(0, 10.0)], 100.0);
        let mut clock = Clock::new(1);
        classify(&mut m, 0, &clock);
        for _ in 0..1000 {
            clock.tick();
        }
        let meta = classify(&mut m, 0, &clock);
        assert_eq!(meta.sched_meta, SchedMeta::MinRate { under_min_rate: true });
        assert_eq!(m.tokens(0), Some(36.0));
    }

    #[test]
    fn flows_without_guarantee_are_over() {
        let mut m = min_rate(&[(0, 1.0)], 1000.0);
        let meta = classify(&mut m, 5, &Clock::default());
        assert_eq!(meta.leaf_node, MinRate::OVER_LEAF);
        assert_eq!(meta.ranks[1], 1);
        assert_eq!(m.tokens(5), None);
    }
}
