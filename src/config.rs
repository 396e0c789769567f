//! Switch configuration.
//!
//! Everything here is consumed once when a [`crate::switch::Switch`] is built and never re-read.
//! Configurations are plain serde types so experiments can be described in JSON files.

use crate::error::ConfigError;
use crate::packet::{FlowId, NodeId, Rank};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Rank handed out to the first packet by the Invert discipline.
pub const DEFAULT_INVERT_MAX_RANK: Rank = 100;

/// Default MinRate burst allowance: ten MTU-sized frames.
pub const DEFAULT_BURST_BYTES: f64 = 15_140.0;

fn default_weight() -> u32 {
    1
}

fn default_latency() -> u64 {
    1
}

fn default_max_rank() -> Rank {
    DEFAULT_INVERT_MAX_RANK
}

fn default_burst() -> f64 {
    DEFAULT_BURST_BYTES
}

/// Recursive scheduling-tree shape descriptor.
///
/// The JSON form mirrors the classic notation: an integer is a leaf with that ID, and a single-key
/// map `{"ID": [children...]}` is a node with that ID and those children. For example:
///
/// ```text
/// single pifo   0              (or {"0": []})
/// 2-level tree  {"0": [1, 2]}
/// 3-level tree  {"0": [{"1": [3, 4]}, {"2": [5, 6]}]}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum TreeShape {
    Leaf(NodeId),
    Node(NodeId, Vec<TreeShape>),
}

impl TreeShape {
    pub fn leaf(id: NodeId) -> Self {
        TreeShape::Leaf(id)
    }

    pub fn node(id: NodeId, children: Vec<TreeShape>) -> Self {
        TreeShape::Node(id, children)
    }

    /// Root with one leaf child per ID: `{root: [leaves...]}`.
    pub fn two_level(root: NodeId, leaves: impl IntoIterator<Item = NodeId>) -> Self {
        TreeShape::Node(root, leaves.into_iter().map(TreeShape::Leaf).collect())
    }

    pub fn id(&self) -> NodeId {
        match self {
            TreeShape::Leaf(id) | TreeShape::Node(id, _) => *id,
        }
    }

    pub fn children(&self) -> &[TreeShape] {
        match self {
            TreeShape::Leaf(_) => &[],
            TreeShape::Node(_, children) => children,
        }
    }

    /// Parse the JSON notation.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)?;
        TreeShape::try_from(value)
    }

    /// Reject descriptors that reuse a node ID.
    pub fn check_unique_ids(&self) -> Result<(), ConfigError> {
        fn walk(shape: &TreeShape, seen: &mut HashSet<NodeId>) -> Result<(), ConfigError> {
            if !seen.insert(shape.id()) {
                return Err(ConfigError::DuplicateNode(shape.id()));
            }
            shape.children().iter().try_for_each(|child| walk(child, seen))
        }
        walk(self, &mut HashSet::new())
    }
}

impl TryFrom<Value> for TreeShape {
    type Error = ConfigError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Number(number) => number
                .as_u64()
                .and_then(|id| NodeId::try_from(id).ok())
                .map(TreeShape::Leaf)
                .ok_or_else(|| ConfigError::MalformedShape(value.to_string())),
            Value::Object(map) if map.len() == 1 => {
                let Some((key, Value::Array(children))) = map.iter().next() else {
                    return Err(ConfigError::MalformedShape(value.to_string()));
                };
                let id = key
                    .parse::<NodeId>()
                    .map_err(|_| ConfigError::MalformedShape(value.to_string()))?;
                let children = children
                    .iter()
                    .cloned()
                    .map(TreeShape::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TreeShape::Node(id, children))
            }
            _ => Err(ConfigError::MalformedShape(value.to_string())),
        }
    }
}

impl From<TreeShape> for Value {
    fn from(shape: TreeShape) -> Self {
        match shape {
            TreeShape::Leaf(id) => Value::from(id),
            TreeShape::Node(id, children) => {
                let mut map = Map::new();
                map.insert(
                    id.to_string(),
                    Value::Array(children.into_iter().map(Value::from).collect()),
                );
                Value::Object(map)
            }
        }
    }
}

impl fmt::Display for TreeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeShape::Leaf(id) => write!(f, "{id}"),
            TreeShape::Node(id, children) => {
                write!(f, "{{{id}: [")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{child}")?;
                }
                write!(f, "]}}")
            }
        }
    }
}

/// Scheduling discipline names accepted on the command line and in scenario files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedAlg {
    Invert,
    Strict,
    RoundRobin,
    WeightedRoundRobin,
    Stfq,
    Hstfq,
    MinRate,
}

impl SchedAlg {
    pub const ALL: [SchedAlg; 7] = [
        SchedAlg::Invert,
        SchedAlg::Strict,
        SchedAlg::RoundRobin,
        SchedAlg::WeightedRoundRobin,
        SchedAlg::Stfq,
        SchedAlg::Hstfq,
        SchedAlg::MinRate,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            SchedAlg::Invert => "Invert",
            SchedAlg::Strict => "Strict",
            SchedAlg::RoundRobin => "RR",
            SchedAlg::WeightedRoundRobin => "WRR",
            SchedAlg::Stfq => "STFQ",
            SchedAlg::Hstfq => "HSTFQ",
            SchedAlg::MinRate => "MinRate",
        }
    }
}

impl fmt::Display for SchedAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SchedAlg {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "invert" | "invert_pkts" => Ok(SchedAlg::Invert),
            "strict" => Ok(SchedAlg::Strict),
            "rr" | "round-robin" => Ok(SchedAlg::RoundRobin),
            "wrr" | "weighted-round-robin" => Ok(SchedAlg::WeightedRoundRobin),
            "stfq" => Ok(SchedAlg::Stfq),
            "hstfq" => Ok(SchedAlg::Hstfq),
            "minrate" | "min-rate" | "min_rate" => Ok(SchedAlg::MinRate),
            _ => Err(ConfigError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Per-flow weight table with a fallback for flows that are not listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightConfig {
    #[serde(default)]
    pub weights: BTreeMap<FlowId, u32>,
    #[serde(default = "default_weight")]
    pub default_weight: u32,
}

impl WeightConfig {
    pub fn weight_of(&self, flow: FlowId) -> u32 {
        self.weights.get(&flow).copied().unwrap_or(self.default_weight)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_weight == 0 {
            return Err(ConfigError::ZeroWeight {
                what: "the default flow".to_string(),
            });
        }
        match self.weights.iter().find(|(_, weight)| **weight == 0) {
            Some((flow, _)) => Err(ConfigError::ZeroWeight {
                what: format!("flow {flow}"),
            }),
            None => Ok(()),
        }
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            weights: BTreeMap::new(),
            default_weight: default_weight(),
        }
    }
}

/// Hierarchical STFQ parameters. Classes are `0..class_weights.len()`; a flow belongs to class
/// `flow % classes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HstfqConfig {
    #[serde(default)]
    pub flow_weights: BTreeMap<FlowId, u32>,
    #[serde(default = "default_weight")]
    pub default_flow_weight: u32,
    pub class_weights: BTreeMap<u16, u32>,
}

impl HstfqConfig {
    pub fn num_classes(&self) -> usize {
        self.class_weights.len()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.class_weights.is_empty() {
            return Err(ConfigError::NoClasses);
        }
        let classes = self.class_weights.len();
        for class in 0..classes {
            let class = u16::try_from(class).map_err(|_| {
                ConfigError::InvalidScenario(format!("too many classes ({classes})"))
            })?;
            match self.class_weights.get(&class) {
                None => return Err(ConfigError::MissingClassWeight { class, classes }),
                Some(0) => {
                    return Err(ConfigError::ZeroWeight {
                        what: format!("class {class}"),
                    })
                }
                Some(_) => {}
            }
        }
        WeightConfig {
            weights: self.flow_weights.clone(),
            default_weight: self.default_flow_weight,
        }
        .validate()
    }
}

/// MinRate parameters. Rates are in bytes per clock period; flows without an entry have no
/// guarantee and are always treated as over their minimum rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinRateConfig {
    #[serde(default)]
    pub min_rates: BTreeMap<FlowId, f64>,
    #[serde(default = "default_burst")]
    pub burst_bytes: f64,
}

impl MinRateConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.burst_bytes > 0.0) {
            return Err(ConfigError::InvalidBurst(self.burst_bytes));
        }
        match self.min_rates.iter().find(|(_, rate)| !(**rate > 0.0)) {
            Some((flow, rate)) => Err(ConfigError::InvalidMinRate {
                flow: *flow,
                rate: *rate,
            }),
            None => Ok(()),
        }
    }
}

/// Scheduling discipline together with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum AlgorithmConfig {
    #[serde(alias = "Invert_pkts")]
    Invert {
        #[serde(default = "default_max_rank")]
        max_rank: Rank,
    },
    Strict,
    #[serde(rename = "RR")]
    RoundRobin,
    #[serde(rename = "WRR")]
    WeightedRoundRobin(WeightConfig),
    #[serde(rename = "STFQ")]
    Stfq(WeightConfig),
    #[serde(rename = "HSTFQ")]
    Hstfq(HstfqConfig),
    MinRate(MinRateConfig),
}

impl AlgorithmConfig {
    pub fn kind(&self) -> SchedAlg {
        match self {
            AlgorithmConfig::Invert { .. } => SchedAlg::Invert,
            AlgorithmConfig::Strict => SchedAlg::Strict,
            AlgorithmConfig::RoundRobin => SchedAlg::RoundRobin,
            AlgorithmConfig::WeightedRoundRobin(_) => SchedAlg::WeightedRoundRobin,
            AlgorithmConfig::Stfq(_) => SchedAlg::Stfq,
            AlgorithmConfig::Hstfq(_) => SchedAlg::Hstfq,
            AlgorithmConfig::MinRate(_) => SchedAlg::MinRate,
        }
    }

    /// Parameter-free defaults for a discipline (HSTFQ defaults to two equally weighted classes).
    pub fn default_for(kind: SchedAlg) -> Self {
        match kind {
            SchedAlg::Invert => AlgorithmConfig::Invert {
                max_rank: DEFAULT_INVERT_MAX_RANK,
            },
            SchedAlg::Strict => AlgorithmConfig::Strict,
            SchedAlg::RoundRobin => AlgorithmConfig::RoundRobin,
            SchedAlg::WeightedRoundRobin => {
                AlgorithmConfig::WeightedRoundRobin(WeightConfig::default())
            }
            SchedAlg::Stfq => AlgorithmConfig::Stfq(WeightConfig::default()),
            SchedAlg::Hstfq => AlgorithmConfig::Hstfq(HstfqConfig {
                flow_weights: BTreeMap::new(),
                default_flow_weight: 1,
                class_weights: BTreeMap::from([(0, 1), (1, 1)]),
            }),
            SchedAlg::MinRate => AlgorithmConfig::MinRate(MinRateConfig {
                min_rates: BTreeMap::new(),
                burst_bytes: DEFAULT_BURST_BYTES,
            }),
        }
    }

    /// Tree shape the discipline is designed for.
    pub fn natural_shape(&self) -> TreeShape {
        match self {
            AlgorithmConfig::Hstfq(cfg) => {
                TreeShape::two_level(0, (1..=cfg.num_classes()).map(|leaf| leaf as NodeId))
            }
            AlgorithmConfig::MinRate(_) => TreeShape::two_level(0, [1, 2]),
            _ => TreeShape::node(0, Vec::new()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            AlgorithmConfig::WeightedRoundRobin(cfg) | AlgorithmConfig::Stfq(cfg) => {
                cfg.validate()
            }
            AlgorithmConfig::Hstfq(cfg) => cfg.validate(),
            AlgorithmConfig::MinRate(cfg) => cfg.validate(),
            AlgorithmConfig::Invert { .. }
            | AlgorithmConfig::Strict
            | AlgorithmConfig::RoundRobin => Ok(()),
        }
    }
}

/// Top-level switch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub algorithm: AlgorithmConfig,
    pub shape: TreeShape,
    /// Per-node queue bound; `None` leaves every node unbounded.
    #[serde(default)]
    pub max_node_size: Option<usize>,
    /// PIFO write latency in clock periods.
    #[serde(default = "default_latency")]
    pub write_latency: u64,
    /// PIFO read latency in clock periods.
    #[serde(default = "default_latency")]
    pub read_latency: u64,
}

impl SwitchConfig {
    /// Configuration for `algorithm` on the tree shape it is designed for.
    pub fn new(algorithm: AlgorithmConfig) -> Self {
        let shape = algorithm.natural_shape();
        Self {
            algorithm,
            shape,
            max_node_size: None,
            write_latency: default_latency(),
            read_latency: default_latency(),
        }
    }

    pub fn with_shape(mut self, shape: TreeShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_max_node_size(mut self, size: Option<usize>) -> Self {
        self.max_node_size = size;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SwitchConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Checks that do not need the built tree. Shape compatibility is checked by the rank engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shape.check_unique_ids()?;
        self.algorithm.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_parses_all_notations() {
        assert_eq!(TreeShape::from_json("0").unwrap(), TreeShape::leaf(0));
        assert_eq!(
            TreeShape::from_json(r#"{"0": []}"#).unwrap(),
            TreeShape::node(0, vec![])
        );
        let three = TreeShape::from_json(r#"{"0": [{"1": [3, 4]}, {"2": [5, 6]}]}"#).unwrap();
        assert_eq!(three.id(), 0);
        assert_eq!(three.children().len(), 2);
        assert_eq!(three.children()[1].children()[0], TreeShape::leaf(5));
        assert_eq!(three.to_string(), "{0: [{1: [3, 4]}, {2: [5, 6]}]}");
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        for text in [
            r#"{"0": [1], "1": []}"#,
            r#"{"a": []}"#,
            r#"{"0": 1}"#,
            r#""zero""#,
            r#"-1"#,
            r#"[0]"#,
            r#"{"0": [{"1": "x"}]}"#,
        ] {
            assert!(
                matches!(TreeShape::from_json(text), Err(ConfigError::MalformedShape(_))),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let shape = TreeShape::two_level(0, [1, 1]);
        assert!(matches!(
            shape.check_unique_ids(),
            Err(ConfigError::DuplicateNode(1))
        ));
    }

    #[test]
    fn shape_round_trips_through_serde() {
        let shape = TreeShape::two_level(0, [1, 2]);
        let text = serde_json::to_string(&shape).unwrap();
        assert_eq!(text, r#"{"0":[1,2]}"#);
    }

    #[test]
    fn switch_config_loads_from_json() {
        let config = SwitchConfig::from_json(
            r#"{
                "algorithm": {"name": "HSTFQ", "class_weights": {"0": 8, "1": 2}},
                "shape": {"0": [1, 2]},
                "max_node_size": 64
            }"#,
        )
        .unwrap();
        assert_eq!(config.algorithm.kind(), SchedAlg::Hstfq);
        assert_eq!(config.max_node_size, Some(64));
        assert_eq!(config.write_latency, 1);
        assert_eq!(config.read_latency, 1);
    }

    #[test]
    fn zero_weights_and_missing_classes_fail_validation() {
        let zero = AlgorithmConfig::Stfq(WeightConfig {
            weights: BTreeMap::from([(3, 0)]),
            default_weight: 1,
        });
        assert!(matches!(zero.validate(), Err(ConfigError::ZeroWeight { .. })));

        let gap = AlgorithmConfig::Hstfq(HstfqConfig {
            flow_weights: BTreeMap::new(),
            default_flow_weight: 1,
            class_weights: BTreeMap::from([(0, 1), (2, 1)]),
        });
        assert!(matches!(
            gap.validate(),
            Err(ConfigError::MissingClassWeight { class: 1, classes: 2 })
        ));
    }

    #[test]
    fn algorithm_names_parse_case_insensitively() {
        assert_eq!("stfq".parse::<SchedAlg>().unwrap(), SchedAlg::Stfq);
        assert_eq!("Invert_pkts".parse::<SchedAlg>().unwrap(), SchedAlg::Invert);
        assert!(matches!(
            "lottery".parse::<SchedAlg>(),
            Err(ConfigError::UnknownAlgorithm(_))
        ));
        for kind in SchedAlg::ALL {
            assert_eq!(kind.label().parse::<SchedAlg>().unwrap(), kind);
            assert_eq!(AlgorithmConfig::default_for(kind).kind(), kind);
        }
    }
}
