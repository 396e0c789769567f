//! Rank engine.
//!
//! Exactly one discipline is active per switch. Each discipline owns its private per-flow or
//! per-class state and, for every packet handed to it by ingress, fills in the rank vector (leaf
//! first), the leaf node and any scratch fields the egress feedback step needs.
//!
//! The engine is checked against the scheduling tree when it is built: a discipline can only run
//! on a tree whose leaves and depth match the rank vectors it emits.

mod hstfq;
mod invert;
mod min_rate;
mod round_robin;
mod stfq;
mod strict;
mod weighted_rr;

pub use hstfq::Hstfq;
pub use invert::Invert;
pub use min_rate::MinRate;
pub use round_robin::RoundRobin;
pub use stfq::Stfq;
pub use strict::Strict;
pub use weighted_rr::WeightedRoundRobin;

use crate::clock::Clock;
use crate::config::{AlgorithmConfig, SchedAlg, TreeShape};
use crate::error::ConfigError;
use crate::packet::{Metadata, NodeId, Packet, Rank};
use crate::virtual_time::SharedVirtualTime;

/// The configured discipline and its state.
#[derive(Debug)]
pub enum RankEngine {
    Invert(Invert),
    Strict(Strict),
    RoundRobin(RoundRobin),
    WeightedRoundRobin(WeightedRoundRobin),
    Stfq(Stfq),
    Hstfq(Hstfq),
    MinRate(MinRate),
}

impl RankEngine {
    /// Build the engine for `config`, checking that it can run on `shape`.
    ///
    /// `virtual_time` is the switch's shared state; only the fair-queueing disciplines keep it.
    pub fn new(
        config: &AlgorithmConfig,
        shape: &TreeShape,
        virtual_time: SharedVirtualTime,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let kind = config.kind();
        let engine = match config {
            AlgorithmConfig::Invert { max_rank } => {
                RankEngine::Invert(Invert::new(*max_rank, flat_leaf(kind, shape)?))
            }
            AlgorithmConfig::Strict => RankEngine::Strict(Strict::new(flat_leaf(kind, shape)?)),
            AlgorithmConfig::RoundRobin => {
                RankEngine::RoundRobin(RoundRobin::new(flat_leaf(kind, shape)?))
            }
            AlgorithmConfig::WeightedRoundRobin(weights) => RankEngine::WeightedRoundRobin(
                WeightedRoundRobin::new(weights.clone(), flat_leaf(kind, shape)?),
            ),
            AlgorithmConfig::Stfq(weights) => RankEngine::Stfq(Stfq::new(
                weights.clone(),
                flat_leaf(kind, shape)?,
                virtual_time,
            )),
            AlgorithmConfig::Hstfq(cfg) => {
                let leaves = (1..=cfg.num_classes()).map(|class| class as NodeId);
                require_leaves_under_root(kind, shape, leaves)?;
                RankEngine::Hstfq(Hstfq::new(cfg.clone(), virtual_time)?)
            }
            AlgorithmConfig::MinRate(cfg) => {
                require_leaves_under_root(kind, shape, [MinRate::UNDER_LEAF, MinRate::OVER_LEAF])?;
                RankEngine::MinRate(MinRate::new(cfg.clone()))
            }
        };
        Ok(engine)
    }

    pub fn kind(&self) -> SchedAlg {
        match self {
            RankEngine::Invert(_) => SchedAlg::Invert,
            RankEngine::Strict(_) => SchedAlg::Strict,
            RankEngine::RoundRobin(_) => SchedAlg::RoundRobin,
            RankEngine::WeightedRoundRobin(_) => SchedAlg::WeightedRoundRobin,
            RankEngine::Stfq(_) => SchedAlg::Stfq,
            RankEngine::Hstfq(_) => SchedAlg::Hstfq,
            RankEngine::MinRate(_) => SchedAlg::MinRate,
        }
    }

    /// Compute the rank vector and leaf node of one packet, updating the discipline's state.
    pub fn rank(&mut self, packet: &Packet, meta: &mut Metadata, clock: &Clock) {
        match self {
            RankEngine::Invert(alg) => alg.rank(meta),
            RankEngine::Strict(alg) => alg.rank(packet, meta),
            RankEngine::RoundRobin(alg) => alg.rank(packet, meta),
            RankEngine::WeightedRoundRobin(alg) => alg.rank(packet, meta),
            RankEngine::Stfq(alg) => alg.rank(packet, meta),
            RankEngine::Hstfq(alg) => alg.rank(packet, meta),
            RankEngine::MinRate(alg) => alg.rank(packet, meta, clock),
        }
    }
}

/// Packet length as a rank increment.
fn len_as_rank(len: usize) -> Rank {
    Rank::try_from(len).unwrap_or(Rank::MAX)
}

fn mismatch(kind: SchedAlg, shape: &TreeShape, reason: String) -> ConfigError {
    ConfigError::ShapeMismatch {
        algorithm: kind.label(),
        shape: shape.to_string(),
        reason,
    }
}

/// Single-level disciplines emit one rank and insert into the root, which must be a lone PIFO.
fn flat_leaf(kind: SchedAlg, shape: &TreeShape) -> Result<NodeId, ConfigError> {
    if shape.children().is_empty() {
        Ok(shape.id())
    } else {
        Err(mismatch(
            kind,
            shape,
            "needs a single PIFO with no children".to_string(),
        ))
    }
}

/// Two-level disciplines insert into specific leaves directly under the root.
fn require_leaves_under_root(
    kind: SchedAlg,
    shape: &TreeShape,
    leaves: impl IntoIterator<Item = NodeId>,
) -> Result<(), ConfigError> {
    for leaf in leaves {
        match shape.children().iter().find(|child| child.id() == leaf) {
            None => {
                return Err(mismatch(
                    kind,
                    shape,
                    format!("root {} has no child {leaf}", shape.id()),
                ))
            }
            Some(child) if !child.children().is_empty() => {
                return Err(mismatch(kind, shape, format!("node {leaf} must be a leaf")))
            }
            Some(_) => {}
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HstfqConfig, MinRateConfig, WeightConfig};
    use std::collections::BTreeMap;

    fn build(config: AlgorithmConfig, shape: TreeShape) -> Result<RankEngine, ConfigError> {
        let vt = SharedVirtualTime::for_algorithm(&config);
        RankEngine::new(&config, &shape, vt)
    }

    #[test]
    fn every_discipline_runs_on_its_natural_shape() {
        for kind in SchedAlg::ALL {
            let config = AlgorithmConfig::default_for(kind);
            let shape = config.natural_shape();
            let engine = build(config, shape).unwrap();
            assert_eq!(engine.kind(), kind);
        }
    }

    #[test]
    fn flat_disciplines_reject_trees() {
        let err = build(AlgorithmConfig::Strict, TreeShape::two_level(0, [1, 2])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ShapeMismatch {
                algorithm: "Strict",
                ..
            }
        ));
    }

    #[test]
    fn flat_discipline_targets_the_root_id() {
        let mut engine = build(AlgorithmConfig::Strict, TreeShape::leaf(7)).unwrap();
        let (packet, mut meta) = test_support::packet(0, 3, 10);
        engine.rank(&packet, &mut meta, &Clock::default());
        assert_eq!(meta.leaf_node, 7);
        assert_eq!(meta.ranks, vec![3]);
    }

    #[test]
    fn hstfq_needs_one_leaf_per_class() {
        let config = AlgorithmConfig::Hstfq(HstfqConfig {
            flow_weights: BTreeMap::new(),
            default_flow_weight: 1,
            class_weights: BTreeMap::from([(0, 1), (1, 1), (2, 1)]),
        });
        let err = build(config, TreeShape::two_level(0, [1, 2])).unwrap_err();
        assert!(matches!(err, ConfigError::ShapeMismatch { reason, .. } if reason.contains("child 3")));
    }

    #[test]
    fn min_rate_needs_leaf_children() {
        let config = AlgorithmConfig::MinRate(MinRateConfig {
            min_rates: BTreeMap::new(),
            burst_bytes: 1000.0,
        });
        let shape = TreeShape::from_json(r#"{"0": [{"1": [3]}, 2]}"#).unwrap();
        assert!(matches!(
            build(config, shape),
            Err(ConfigError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn invalid_parameters_are_rejected_before_shape_checks() {
        let config = AlgorithmConfig::WeightedRoundRobin(WeightConfig {
            weights: BTreeMap::new(),
            default_weight: 0,
        });
        assert!(matches!(
            build(config, TreeShape::leaf(0)),
            Err(ConfigError::ZeroWeight { .. })
        ));
    }
}
