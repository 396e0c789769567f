//! Hierarchical STFQ.
//!
//! Two independent STFQ computations per packet. At the leaf level each flow competes with the
//! other flows of its class against that class's flow virtual time; at the root each class
//! competes as one aggregate flow against the class virtual time. A flow belongs to class
//! `flow % classes` and class `c` lives in leaf `c + 1`.

use super::len_as_rank;
use crate::config::HstfqConfig;
use crate::error::ConfigError;
use crate::packet::{FlowId, Metadata, NodeId, Packet, Rank, SchedMeta};
use crate::virtual_time::SharedVirtualTime;
use std::collections::HashMap;

#[derive(Debug)]
pub struct Hstfq {
    cfg: HstfqConfig,
    classes: u16,
    flow_finish: HashMap<FlowId, Rank>,
    class_finish: HashMap<u16, Rank>,
    virtual_time: SharedVirtualTime,
}

impl Hstfq {
    pub fn new(cfg: HstfqConfig, virtual_time: SharedVirtualTime) -> Result<Self, ConfigError> {
        let classes = u16::try_from(cfg.num_classes())
            .ok()
            .filter(|classes| *classes > 0)
            .ok_or(ConfigError::NoClasses)?;
        Ok(Self {
            cfg,
            classes,
            flow_finish: HashMap::new(),
            class_finish: HashMap::new(),
            virtual_time,
        })
    }

    pub fn class_of(&self, flow: FlowId) -> u16 {
        flow % self.classes
    }

    pub fn leaf_of(class: u16) -> NodeId {
        NodeId::from(class) + 1
    }

    pub(crate) fn rank(&mut self, packet: &Packet, meta: &mut Metadata) {
        let flow = packet.flow_id();
        let class = self.class_of(flow);
        let len = len_as_rank(meta.pkt_len);

        let flow_weight = self
            .cfg
            .flow_weights
            .get(&flow)
            .copied()
            .unwrap_or(self.cfg.default_flow_weight);
        let flow_start = start_tag(
            self.virtual_time.flow(class),
            self.flow_finish.get(&flow).copied(),
        );
        self.flow_finish
            .insert(flow, flow_start + len / Rank::from(flow_weight));

        // Validation guarantees a weight for every class below `classes`.
        let class_weight = self.cfg.class_weights.get(&class).copied().unwrap_or(1);
        let class_start = start_tag(
            self.virtual_time.class(),
            self.class_finish.get(&class).copied(),
        );
        self.class_finish
            .insert(class, class_start + len / Rank::from(class_weight));

        meta.ranks = vec![flow_start, class_start];
        meta.leaf_node = Self::leaf_of(class);
        meta.sched_meta = SchedMeta::Hstfq {
            class,
            flow_start,
            class_start,
        };
    }
}

fn start_tag(virtual_time: Rank, last_finish: Option<Rank>) -> Rank {
    last_finish.map_or(virtual_time, |finish| virtual_time.max(finish))
}
