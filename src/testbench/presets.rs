//! Built-in scenarios, one per discipline.

use super::{Expectation, FlowSpec, Scenario, StartDequeue};
use crate::clock::{Cycle, NS_PER_CYCLE};
use crate::config::{
    AlgorithmConfig, HstfqConfig, MinRateConfig, SwitchConfig, WeightConfig, DEFAULT_BURST_BYTES,
};
use crate::error::ConfigError;
use crate::packet::FlowId;
use std::collections::BTreeMap;

pub const PRESET_NAMES: [&str; 7] = ["invert", "strict", "rr", "wrr", "stfq", "hstfq", "min-rate"];

/// Offered rates shared by the round-robin style presets.
const FOUR_FLOW_RATES: [f64; 4] = [10.0, 13.0, 20.0, 25.0];

/// Link rate in Gbps expressed in bytes per clock period.
pub fn bytes_per_period(gbps: f64) -> f64 {
    gbps * NS_PER_CYCLE / 8.0
}

/// Look up a preset by name.
pub fn preset(name: &str) -> Result<Scenario, ConfigError> {
    match name.to_ascii_lowercase().as_str() {
        "invert" | "invert_pkts" => Ok(invert()),
        "strict" => Ok(strict()),
        "rr" => Ok(round_robin()),
        "wrr" => Ok(weighted_round_robin()),
        "stfq" => Ok(stfq()),
        "hstfq" => Ok(hstfq()),
        "min-rate" | "minrate" | "min_rate" => Ok(min_rate()),
        _ => Err(ConfigError::InvalidScenario(format!(
            "unknown preset `{name}`, expected one of {}",
            PRESET_NAMES.join(", ")
        ))),
    }
}

fn cycle_limited(rates: &[f64], limit: Cycle) -> Vec<FlowSpec> {
    rates
        .iter()
        .enumerate()
        .map(|(flow, rate)| FlowSpec::new(flow as FlowId, *rate).cycle_limit(limit))
        .collect()
}

/// Ten packets inserted back to back, then read out in reverse.
pub fn invert() -> Scenario {
    let flow = FlowSpec {
        payload_bytes: 20,
        ..FlowSpec::new(20, 100.0).pkt_limit(10)
    };
    Scenario {
        start_dequeue: StartDequeue::AfterInput { delay: 20 },
        expect: Expectation::ReversedInput,
        ..Scenario::new(
            "invert",
            SwitchConfig::new(AlgorithmConfig::Invert { max_rank: 100 }),
            vec![flow],
        )
    }
}

/// Flow 0 bursts at 5 Gbps over a steady 20 Gbps flow 1 on a 10 Gbps link.
pub fn strict() -> Scenario {
    let flows = vec![
        FlowSpec::new(0, 5.0).cycle_limit(8_000).burst(200, 2_000),
        FlowSpec::new(1, 20.0).cycle_limit(8_000),
    ];
    Scenario::new("strict", SwitchConfig::new(AlgorithmConfig::Strict), flows)
}

pub fn round_robin() -> Scenario {
    Scenario::new(
        "rr",
        SwitchConfig::new(AlgorithmConfig::RoundRobin),
        cycle_limited(&FOUR_FLOW_RATES, 5_000),
    )
}

pub fn weighted_round_robin() -> Scenario {
    let weights = WeightConfig {
        weights: BTreeMap::from([(0, 1), (1, 2), (2, 3), (3, 4)]),
        default_weight: 1,
    };
    Scenario::new(
        "wrr",
        SwitchConfig::new(AlgorithmConfig::WeightedRoundRobin(weights)),
        cycle_limited(&FOUR_FLOW_RATES, 5_000),
    )
}

/// Four flows at 10, 20, 30 and 40 Gbps sharing a 10 Gbps link.
pub fn stfq() -> Scenario {
    let flows = (0..4u16)
        .map(|i| FlowSpec::new(100 + i, 10.0 * f64::from(i + 1)).pkt_limit(1_000))
        .collect();
    Scenario::new(
        "stfq",
        SwitchConfig::new(AlgorithmConfig::Stfq(WeightConfig::default())),
        flows,
    )
}

/// Two classes weighted 8:2; even flows are class 0 and odd flows class 1.
pub fn hstfq() -> Scenario {
    let cfg = HstfqConfig {
        flow_weights: (0..4).map(|flow| (flow, 1)).collect(),
        default_flow_weight: 1,
        class_weights: BTreeMap::from([(0, 8), (1, 2)]),
    };
    Scenario::new(
        "hstfq",
        SwitchConfig::new(AlgorithmConfig::Hstfq(cfg)),
        cycle_limited(&FOUR_FLOW_RATES, 5_000),
    )
}

/// A 2 Gbps flow guaranteed 3 Gbps competing with an unguaranteed 20 Gbps flow.
pub fn min_rate() -> Scenario {
    let cfg = MinRateConfig {
        min_rates: BTreeMap::from([(0, bytes_per_period(3.0))]),
        burst_bytes: DEFAULT_BURST_BYTES,
    };
    Scenario::new(
        "min-rate",
        SwitchConfig::new(AlgorithmConfig::MinRate(cfg)),
        cycle_limited(&[2.0, 20.0], 5_000),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_name_resolves_and_validates() {
        for name in PRESET_NAMES {
            let scenario = preset(name).unwrap();
            assert_eq!(scenario.name, name);
            scenario.validate().unwrap();
        }
        assert!(preset("fifo").is_err());
    }

    #[test]
    fn rate_conversion() {
        // 8 Gbps is one byte per ns.
        assert!((bytes_per_period(8.0) - 5.0).abs() < 1e-12);
    }
}
