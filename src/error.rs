//! Error taxonomy.
//!
//! Only two kinds of failure exist: configuration errors, raised while a switch is being built,
//! and integrity violations, raised while it runs. Both are fatal. Transient emptiness and queue
//! overflow are absorbed by the component that sees them and never surface here.

use crate::clock::Cycle;
use crate::packet::NodeId;

/// Problems detected while building a switch from its configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("incorrect format of shape: {0}")]
    MalformedShape(String),
    #[error("node ID {0} appears more than once in the shape")]
    DuplicateNode(NodeId),
    #[error("unknown scheduling algorithm `{0}`")]
    UnknownAlgorithm(String),
    #[error("weight for {what} must be non-zero")]
    ZeroWeight { what: String },
    #[error("missing weight for class {class} ({classes} classes configured)")]
    MissingClassWeight { class: u16, classes: usize },
    #[error("HSTFQ needs at least one class weight")]
    NoClasses,
    #[error("minimum rate for flow {flow} must be positive, got {rate}")]
    InvalidMinRate { flow: u16, rate: f64 },
    #[error("burst allowance must be positive, got {0}")]
    InvalidBurst(f64),
    #[error("{algorithm} cannot run on tree {shape}: {reason}")]
    ShapeMismatch {
        algorithm: &'static str,
        shape: String,
        reason: String,
    },
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Violations of the rank-engine/tree contract detected during simulation.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("packet {packet} targets unknown leaf node {node}")]
    UnknownLeaf { packet: u64, node: NodeId },
    #[error("packet {packet} targets node {node}, which is not a leaf")]
    NotALeaf { packet: u64, node: NodeId },
    #[error("packet {packet} carries {ranks} ranks but the path from leaf {leaf} to the root has depth {depth}")]
    RankVectorMismatch {
        packet: u64,
        leaf: NodeId,
        ranks: usize,
        depth: usize,
    },
    #[error("node {node} returned pointer to {child}, which is not one of its children")]
    UnknownChild { node: NodeId, child: NodeId },
    #[error("internal node {node} returned packet {packet} instead of a child pointer")]
    PacketAtInternalNode { node: NodeId, packet: u64 },
    #[error("{stage} lost its peer on the {pipe} pipe")]
    Disconnected {
        stage: &'static str,
        pipe: &'static str,
    },
}

/// Any error that stops a running simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("integrity violation at cycle {cycle}: {source}")]
    Integrity {
        cycle: Cycle,
        #[source]
        source: IntegrityError,
    },
    #[error("simulation exceeded its limit of {0} cycles")]
    CycleLimit(Cycle),
    #[error("cycle {0} did not settle after {1} delta steps")]
    Livelock(Cycle, usize),
}

impl SimError {
    /// Attach the cycle at which an integrity violation was observed.
    pub fn integrity(cycle: Cycle, source: IntegrityError) -> Self {
        SimError::Integrity { cycle, source }
    }
}
