//! Global virtual-time state for the fair-queueing disciplines.
//!
//! Owned by one switch instance and handed to both the rank engine (reader) and the egress stage
//! (sole writer). The egress stage updates it after every dequeue, and the rank engine reads it
//! when it ranks the next packet. Both stages run on the same simulation loop, so the mutex is
//! never contended; it only makes the handle `Send + Sync` so switches can live on any thread.

use crate::config::AlgorithmConfig;
use crate::packet::{Rank, SchedMeta};
use parking_lot::Mutex;
use std::sync::Arc;

/// Virtual-time scalars for the active discipline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VirtualTime {
    /// Disciplines without fair-queueing feedback.
    #[default]
    None,
    /// STFQ: one scalar for the whole switch.
    Flat { virtual_time: Rank },
    /// HSTFQ: one flow-level scalar per class plus the class-level scalar.
    Hierarchical { flow: Vec<Rank>, class: Rank },
}

impl VirtualTime {
    /// Zeroed state sized for `algorithm`.
    pub fn for_algorithm(algorithm: &AlgorithmConfig) -> Self {
        match algorithm {
            AlgorithmConfig::Stfq(_) => VirtualTime::Flat { virtual_time: 0 },
            AlgorithmConfig::Hstfq(cfg) => VirtualTime::Hierarchical {
                flow: vec![0; cfg.num_classes()],
                class: 0,
            },
            _ => VirtualTime::None,
        }
    }
}

/// Cloneable handle to a switch's [`VirtualTime`].
#[derive(Debug, Clone, Default)]
pub struct SharedVirtualTime {
    inner: Arc<Mutex<VirtualTime>>,
}

impl SharedVirtualTime {
    pub fn new(state: VirtualTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn for_algorithm(algorithm: &AlgorithmConfig) -> Self {
        Self::new(VirtualTime::for_algorithm(algorithm))
    }

    /// Flat virtual time, or 0 when the state is not flat.
    pub fn flat(&self) -> Rank {
        match &*self.inner.lock() {
            VirtualTime::Flat { virtual_time } => *virtual_time,
            _ => 0,
        }
    }

    /// Flow-level virtual time of `class`, or 0 when unknown.
    pub fn flow(&self, class: u16) -> Rank {
        match &*self.inner.lock() {
            VirtualTime::Hierarchical { flow, .. } => {
                flow.get(usize::from(class)).copied().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Class-level virtual time, or 0 when the state is not hierarchical.
    pub fn class(&self) -> Rank {
        match &*self.inner.lock() {
            VirtualTime::Hierarchical { class, .. } => *class,
            _ => 0,
        }
    }

    /// Egress feedback: advance virtual time to the start tags of the packet just released.
    ///
    /// Returns `true` if anything was written.
    pub fn apply(&self, meta: &SchedMeta) -> bool {
        let mut state = self.inner.lock();
        match (&mut *state, *meta) {
            (VirtualTime::Flat { virtual_time }, SchedMeta::Stfq { start }) => {
                *virtual_time = start;
                true
            }
            (
                VirtualTime::Hierarchical { flow, class },
                SchedMeta::Hstfq {
                    class: class_id,
                    flow_start,
                    class_start,
                },
            ) => {
                if let Some(slot) = flow.get_mut(usize::from(class_id)) {
                    *slot = flow_start;
                }
                *class = class_start;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> VirtualTime {
        self.inner.lock().clone()
    }
}
