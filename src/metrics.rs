//! Per-flow statistics over captured packet timelines.
//!
//! A timeline is a list of `(cycle, flow, bytes)` samples, such as the arbiter's ingress capture
//! or the receiver's output capture. Rates are measured over averaging intervals: bytes are
//! accumulated until a sample lands more than one interval after the current interval start, at
//! which point a rate point is emitted at the interval midpoint.

use crate::clock::{Cycle, NS_PER_CYCLE};
use crate::packet::FlowId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default rate averaging interval.
pub const RATE_AVG_INTERVAL_NS: f64 = 1_000.0;

/// One measured rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    pub time_ns: f64,
    pub gbps: f64,
}

/// Samples and derived rates of one flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSeries {
    pub packets: u64,
    pub bytes: u64,
    pub first_cycle: Cycle,
    pub last_cycle: Cycle,
    pub rates: Vec<RatePoint>,
    #[serde(skip)]
    samples: Vec<(Cycle, usize)>,
}

impl FlowSeries {
    /// Average rate between the first and last sample.
    pub fn mean_gbps(&self) -> f64 {
        let span_ns = (self.last_cycle.saturating_sub(self.first_cycle)) as f64 * NS_PER_CYCLE;
        if span_ns > 0.0 {
            self.bytes as f64 * 8.0 / span_ns
        } else {
            0.0
        }
    }

    /// Packets observed in `[from, to)`.
    pub fn packets_between(&self, from: Cycle, to: Cycle) -> u64 {
        self.samples
            .iter()
            .filter(|(cycle, _)| (from..to).contains(cycle))
            .count() as u64
    }

    fn compute_rates(&mut self, interval_ns: f64) {
        self.rates.clear();
        let Some((first, _)) = self.samples.first() else {
            return;
        };
        let mut window_start = *first as f64 * NS_PER_CYCLE;
        let mut window_bytes = 0usize;
        for (cycle, len) in &self.samples {
            let now_ns = *cycle as f64 * NS_PER_CYCLE;
            if now_ns <= window_start + interval_ns {
                window_bytes += len;
            } else {
                let span = now_ns - window_start;
                self.rates.push(RatePoint {
                    time_ns: (now_ns + window_start) / 2.0,
                    gbps: window_bytes as f64 * 8.0 / span,
                });
                window_start = now_ns;
                window_bytes = *len;
            }
        }
    }
}

/// Statistics for every flow in a timeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStats {
    pub interval_ns: f64,
    pub flows: BTreeMap<FlowId, FlowSeries>,
}

impl FlowStats {
    /// Build from samples in time order.
    pub fn from_samples(
        samples: impl IntoIterator<Item = (Cycle, FlowId, usize)>,
        interval_ns: f64,
    ) -> Self {
        let mut flows: BTreeMap<FlowId, FlowSeries> = BTreeMap::new();
        for (cycle, flow, len) in samples {
            let series = flows.entry(flow).or_insert_with(|| FlowSeries {
                first_cycle: cycle,
                ..FlowSeries::default()
            });
            series.packets += 1;
            series.bytes += len as u64;
            series.last_cycle = cycle;
            series.samples.push((cycle, len));
        }
        for series in flows.values_mut() {
            series.compute_rates(interval_ns);
        }
        Self { interval_ns, flows }
    }

    pub fn get(&self, flow: FlowId) -> Option<&FlowSeries> {
        self.flows.get(&flow)
    }

    pub fn total_packets(&self) -> u64 {
        self.flows.values().map(|series| series.packets).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.flows.values().map(|series| series.bytes).sum()
    }

    /// Fraction of all bytes that belong to `flow`.
    pub fn byte_share(&self, flow: FlowId) -> f64 {
        let total = self.total_bytes();
        match (self.flows.get(&flow), total) {
            (Some(series), total) if total > 0 => series.bytes as f64 / total as f64,
            _ => 0.0,
        }
    }

    /// Byte share per class, where a flow belongs to class `flow % classes`.
    pub fn class_shares(&self, classes: u16) -> BTreeMap<u16, f64> {
        let mut shares = BTreeMap::new();
        if classes == 0 {
            return shares;
        }
        for flow in self.flows.keys() {
            *shares.entry(flow % classes).or_insert(0.0) += self.byte_share(*flow);
        }
        shares
    }

    /// Compact per-flow summary suitable for printing or JSON output.
    pub fn summary(&self) -> Vec<FlowSummary> {
        self.flows
            .iter()
            .map(|(flow, series)| FlowSummary {
                flow: *flow,
                packets: series.packets,
                bytes: series.bytes,
                share: self.byte_share(*flow),
                mean_gbps: series.mean_gbps(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSummary {
    pub flow: FlowId,
    pub packets: u64,
    pub bytes: u64,
    pub share: f64,
    pub mean_gbps: f64,
}
