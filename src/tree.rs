//! Hierarchical PIFO scheduling tree.
//!
//! The tree is an arena of [`PifoNode`]s indexed by position, built once from a [`TreeShape`].
//! Leaves hold packets; internal nodes hold pointers (node IDs) to their children. Parent links
//! are plain indexes used for lookup only, so there is no ownership cycle.
//!
//! Enqueue: the packet is written into its leaf with `ranks[0]`, then for each ancestor at level
//! `L` the pointer to the node below is written with `ranks[L]`. Each write is acknowledged
//! before the next one is issued.
//!
//! Dequeue: the root is read first; while the popped entry is a pointer, the pointed-to child is
//! read next, until a packet comes out.
//!
//! Only leaves are bounded. When a leaf evicts a packet, one pointer to that leaf is retracted
//! from every ancestor, so each internal node holds exactly one pointer per packet queued below
//! it. If an ancestor has no such pointer committed yet, the pointer the current walk is about to
//! write there is cancelled instead.

use crate::clock::Clock;
use crate::config::TreeShape;
use crate::error::{ConfigError, IntegrityError, SimError};
use crate::packet::{Metadata, NodeId, Packet, Rank};
use crate::pifo::{PifoNode, PifoPort, PifoTiming};
use crate::pipe::{ConsumerEnd, ProducerEnd, Recv};
use crate::sim::{Activity, Process, Shutdown};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, trace};

/// Content of a PIFO slot: a queued packet (leaves) or a pointer to a child (internal nodes).
#[derive(Debug)]
pub enum TreeEntry {
    Packet(Box<(Metadata, Packet)>),
    Child(NodeId),
}

struct TreeNode {
    pifo: PifoNode<TreeEntry>,
    port: PifoPort<TreeEntry>,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Number of nodes on the path from this node up to the root, itself included.
    depth: usize,
    /// Pointer writes of the current walk to skip here, owed to leaf evictions.
    cancelled_writes: u64,
}

impl TreeNode {
    fn id(&self) -> NodeId {
        self.pifo.id()
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Progress of the leaf-to-root enqueue walk for the packet currently being inserted.
#[derive(Default)]
enum WriteWalk {
    #[default]
    Idle,
    AwaitingPacket,
    AwaitingAck {
        at: usize,
        level: usize,
        ranks: Vec<Rank>,
        packet: u64,
    },
}

/// Progress of the root-to-leaf pointer chase for the current dequeue.
#[derive(Default, Clone, Copy)]
enum ReadChase {
    #[default]
    Idle,
    AwaitingNode {
        at: usize,
    },
}

pub struct SchedulingTree {
    nodes: Vec<TreeNode>,
    index: HashMap<NodeId, usize>,
    root: usize,
    shape: TreeShape,
    input: ConsumerEnd<(Metadata, Packet)>,
    output: ProducerEnd<(Metadata, Packet)>,
    shutdown: Shutdown,
    writer: WriteWalk,
    reader: ReadChase,
}

impl SchedulingTree {
    /// Build the tree described by `shape`.
    ///
    /// `input` is the ingress → tree link (the tree grants ready tokens on it); `output` is the
    /// tree → egress link (egress ready tokens are read requests).
    pub fn new(
        shape: &TreeShape,
        capacity: Option<usize>,
        timing: PifoTiming,
        shutdown: Shutdown,
        input: ConsumerEnd<(Metadata, Packet)>,
        output: ProducerEnd<(Metadata, Packet)>,
    ) -> Result<Self, ConfigError> {
        shape.check_unique_ids()?;
        let mut nodes = Vec::new();
        let mut index = HashMap::new();
        let root = Self::make_node(
            shape, None, 1, capacity, timing, &shutdown, &mut nodes, &mut index,
        );
        Ok(Self {
            nodes,
            index,
            root,
            shape: shape.clone(),
            input,
            output,
            shutdown,
            writer: WriteWalk::Idle,
            reader: ReadChase::Idle,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn make_node(
        shape: &TreeShape,
        parent: Option<usize>,
        depth: usize,
        capacity: Option<usize>,
        timing: PifoTiming,
        shutdown: &Shutdown,
        nodes: &mut Vec<TreeNode>,
        index: &mut HashMap<NodeId, usize>,
    ) -> usize {
        let bound = if shape.children().is_empty() {
            capacity
        } else {
            None
        };
        let (pifo, port) = PifoNode::new(shape.id(), bound, timing, shutdown.clone());
        let position = nodes.len();
        nodes.push(TreeNode {
            pifo,
            port,
            parent,
            children: Vec::new(),
            depth,
            cancelled_writes: 0,
        });
        index.insert(shape.id(), position);
        for child in shape.children() {
            let child_position = Self::make_node(
                child,
                Some(position),
                depth + 1,
                capacity,
                timing,
                shutdown,
                nodes,
                index,
            );
            nodes[position].children.push(child_position);
        }
        position
    }

    pub fn shape(&self) -> &TreeShape {
        &self.shape
    }

    pub fn root_id(&self) -> NodeId {
        self.nodes[self.root].id()
    }

    /// Node IDs in construction (pre-order) order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(TreeNode::id).collect()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn is_leaf(&self, id: NodeId) -> Option<bool> {
        self.node(id).map(TreeNode::is_leaf)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.parent.map(|parent| self.nodes[parent].id())
    }

    pub fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.node(id)
            .map(|node| node.children.iter().map(|c| self.nodes[*c].id()).collect())
            .unwrap_or_default()
    }

    /// Length of the rank vector a packet entering at `id` must carry.
    pub fn depth_of(&self, id: NodeId) -> Option<usize> {
        self.node(id).map(|node| node.depth)
    }

    /// Entries currently stored at `id`.
    pub fn len_of(&self, id: NodeId) -> Option<usize> {
        self.node(id).map(|node| node.pifo.len())
    }

    /// Evictions per node. Internal nodes are unbounded and always report zero.
    pub fn drop_counts(&self) -> BTreeMap<NodeId, u64> {
        self.nodes
            .iter()
            .map(|node| (node.id(), node.pifo.drop_count()))
            .collect()
    }

    /// Packets lost to evictions at leaves.
    pub fn dropped_packets(&self) -> u64 {
        self.nodes
            .iter()
            .filter(|node| node.is_leaf())
            .map(|node| node.pifo.drop_count())
            .sum()
    }

    fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.index.get(&id).map(|position| &self.nodes[*position])
    }

    /// Resolve and sanity-check the leaf a packet asks to be inserted into.
    fn admit(&self, meta: &Metadata, packet: &Packet) -> Result<usize, IntegrityError> {
        let position = *self
            .index
            .get(&meta.leaf_node)
            .ok_or(IntegrityError::UnknownLeaf {
                packet: packet.id,
                node: meta.leaf_node,
            })?;
        let leaf = &self.nodes[position];
        if !leaf.is_leaf() {
            return Err(IntegrityError::NotALeaf {
                packet: packet.id,
                node: meta.leaf_node,
            });
        }
        if meta.ranks.len() != leaf.depth {
            return Err(IntegrityError::RankVectorMismatch {
                packet: packet.id,
                leaf: meta.leaf_node,
                ranks: meta.ranks.len(),
                depth: leaf.depth,
            });
        }
        Ok(position)
    }

    fn step_writer(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = Activity::Blocked;
        loop {
            match std::mem::take(&mut self.writer) {
                WriteWalk::Idle => {
                    if self.shutdown.is_requested() {
                        return Ok(activity);
                    }
                    if !self.input.grant() {
                        return Err(disconnected(clock, "ingress"));
                    }
                    self.writer = WriteWalk::AwaitingPacket;
                    activity = Activity::Progressed;
                }
                WriteWalk::AwaitingPacket => match self.input.poll_data() {
                    Recv::Item((meta, packet)) => {
                        let leaf = self
                            .admit(&meta, &packet)
                            .map_err(|err| SimError::integrity(clock.now(), err))?;
                        let ranks = meta.ranks.clone();
                        let packet_id = packet.id;
                        trace!(packet = packet_id, leaf = meta.leaf_node, ?ranks, "enqueue");
                        if !self.nodes[leaf]
                            .port
                            .write(ranks[0], TreeEntry::Packet(Box::new((meta, packet))))
                        {
                            return Err(disconnected(clock, "pifo write"));
                        }
                        self.writer = WriteWalk::AwaitingAck {
                            at: leaf,
                            level: 0,
                            ranks,
                            packet: packet_id,
                        };
                        activity = Activity::Progressed;
                    }
                    Recv::Empty | Recv::Closed => {
                        self.writer = WriteWalk::AwaitingPacket;
                        return Ok(activity);
                    }
                },
                WriteWalk::AwaitingAck {
                    at,
                    level,
                    ranks,
                    packet,
                } => match self.nodes[at].port.poll_write_done() {
                    Recv::Item(()) => {
                        activity = Activity::Progressed;
                        self.writer = self.write_pointer_above(at, level, ranks, packet, clock)?;
                    }
                    Recv::Empty | Recv::Closed => {
                        self.writer = WriteWalk::AwaitingAck {
                            at,
                            level,
                            ranks,
                            packet,
                        };
                        return Ok(activity);
                    }
                },
            }
        }
    }

    /// Issue the next pointer write of the walk above `at`, skipping cancelled ones.
    fn write_pointer_above(
        &mut self,
        mut at: usize,
        mut level: usize,
        ranks: Vec<Rank>,
        packet: u64,
        clock: &Clock,
    ) -> Result<WriteWalk, SimError> {
        while let Some(parent) = self.nodes[at].parent {
            level += 1;
            let child = self.nodes[at].id();
            if self.nodes[parent].cancelled_writes > 0 {
                self.nodes[parent].cancelled_writes -= 1;
                trace!(node = self.nodes[parent].id(), child, packet, "pointer write cancelled");
                at = parent;
                continue;
            }
            if !self.nodes[parent]
                .port
                .write(ranks[level], TreeEntry::Child(child))
            {
                return Err(disconnected(clock, "pifo write"));
            }
            return Ok(WriteWalk::AwaitingAck {
                at: parent,
                level,
                ranks,
                packet,
            });
        }
        debug!(packet, cycle = clock.now(), "enqueue walk complete");
        Ok(WriteWalk::Idle)
    }

    /// Retract one pointer per eviction from every ancestor of each evicting leaf.
    fn retract_evicted(&mut self) -> Activity {
        let mut activity = Activity::Blocked;
        for leaf in 0..self.nodes.len() {
            for _ in 0..self.nodes[leaf].pifo.take_evictions() {
                activity = Activity::Progressed;
                let mut at = leaf;
                while let Some(parent) = self.nodes[at].parent {
                    let child = self.nodes[at].id();
                    let node = &mut self.nodes[parent];
                    match node
                        .pifo
                        .retract(|entry| matches!(entry, TreeEntry::Child(id) if *id == child))
                    {
                        Some(rank) => trace!(node = node.id(), child, rank, "pointer retracted"),
                        None => node.cancelled_writes += 1,
                    }
                    at = parent;
                }
            }
        }
        activity
    }

    fn step_reader(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = Activity::Blocked;
        loop {
            match self.reader {
                ReadChase::Idle => {
                    if self.shutdown.is_requested() {
                        return Ok(activity);
                    }
                    match self.output.poll_ready() {
                        Recv::Item(_) => {
                            if !self.nodes[self.root].port.read() {
                                return Err(disconnected(clock, "pifo read"));
                            }
                            self.reader = ReadChase::AwaitingNode { at: self.root };
                            activity = Activity::Progressed;
                        }
                        Recv::Empty | Recv::Closed => return Ok(activity),
                    }
                }
                ReadChase::AwaitingNode { at } => match self.nodes[at].port.poll_read_data() {
                    Recv::Item((rank, TreeEntry::Child(child))) => {
                        let next = self
                            .index
                            .get(&child)
                            .copied()
                            .filter(|position| self.nodes[*position].parent == Some(at))
                            .ok_or_else(|| {
                                SimError::integrity(
                                    clock.now(),
                                    IntegrityError::UnknownChild {
                                        node: self.nodes[at].id(),
                                        child,
                                    },
                                )
                            })?;
                        trace!(node = self.nodes[at].id(), rank, child, "follow pointer");
                        if !self.nodes[next].port.read() {
                            return Err(disconnected(clock, "pifo read"));
                        }
                        self.reader = ReadChase::AwaitingNode { at: next };
                        activity = Activity::Progressed;
                    }
                    Recv::Item((rank, TreeEntry::Packet(entry))) => {
                        let node = &self.nodes[at];
                        if !node.is_leaf() {
                            return Err(SimError::integrity(
                                clock.now(),
                                IntegrityError::PacketAtInternalNode {
                                    node: node.id(),
                                    packet: entry.1.id,
                                },
                            ));
                        }
                        debug!(leaf = node.id(), rank, packet = entry.1.id, "dequeue");
                        if self.output.push(*entry).is_err() {
                            return Err(disconnected(clock, "egress"));
                        }
                        self.reader = ReadChase::Idle;
                        activity = Activity::Progressed;
                    }
                    Recv::Empty | Recv::Closed => return Ok(activity),
                },
            }
        }
    }
}

fn disconnected(clock: &Clock, pipe: &'static str) -> SimError {
    SimError::integrity(
        clock.now(),
        IntegrityError::Disconnected {
            stage: "scheduling tree",
            pipe,
        },
    )
}

impl Process for SchedulingTree {
    fn name(&self) -> &'static str {
        "scheduling tree"
    }

    /// Enqueue walk, then dequeue chase, then every node in construction order, then pointer
    /// retraction for whatever the leaves evicted.
    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = self.step_writer(clock)?;
        activity |= self.step_reader(clock)?;
        for node in &mut self.nodes {
            activity |= node.pifo.step(clock)?;
        }
        activity |= self.retract_evicted();
        Ok(activity)
    }

    fn busy(&self) -> bool {
        matches!(self.writer, WriteWalk::AwaitingAck { .. })
            || self.nodes.iter().any(|node| node.pifo.busy())
    }
}

impl fmt::Display for SchedulingTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_node(
            tree: &SchedulingTree,
            position: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            let node = &tree.nodes[position];
            write!(f, "[{}, [", node.id())?;
            for (i, child) in node.children.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write_node(tree, *child, f)?;
            }
            write!(f, "]]")
        }
        write_node(self, self.root, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FiveTuple;
    use crate::pipe::link;

    struct Harness {
        tree: SchedulingTree,
        clock: Clock,
        ingress: ProducerEnd<(Metadata, Packet)>,
        egress: ConsumerEnd<(Metadata, Packet)>,
    }

    impl Harness {
        fn new(shape: TreeShape, capacity: Option<usize>) -> Self {
            let (ingress, tree_in) = link();
            let (tree_out, egress) = link();
            let tree = SchedulingTree::new(
                &shape,
                capacity,
                PifoTiming::default(),
                Shutdown::new(),
                tree_in,
                tree_out,
            )
            .unwrap();
            Self {
                tree,
                clock: Clock::new(1),
                ingress,
                egress,
            }
        }

        fn settle(&mut self) -> Result<(), SimError> {
            while self.tree.step(&self.clock)?.progressed() {}
            Ok(())
        }

        fn tick(&mut self) -> Result<(), SimError> {
            self.settle()?;
            self.clock.tick();
            self.settle()
        }

        /// Push one packet once the tree grants a ready token, then let the walk finish.
        fn enqueue(&mut self, id: u64, leaf: NodeId, ranks: Vec<Rank>) -> Result<(), SimError> {
            self.settle()?;
            assert_eq!(self.ingress.poll_ready(), Recv::Item(crate::pipe::Ready));
            let packet = Packet::filled(id, FiveTuple::tcp(id as u16, 80), 10);
            let mut meta = Metadata::for_packet(&packet, 1, 4);
            meta.leaf_node = leaf;
            meta.ranks = ranks;
            self.ingress.push((meta, packet)).unwrap();
            for _ in 0..8 {
                self.tick()?;
            }
            Ok(())
        }

        fn dequeue(&mut self) -> Option<u64> {
            assert!(self.egress.grant());
            for _ in 0..8 {
                self.tick().unwrap();
                if let Recv::Item((_, packet)) = self.egress.poll_data() {
                    return Some(packet.id);
                }
            }
            None
        }
    }

    #[test]
    fn builds_arena_from_shape() {
        let harness = Harness::new(
            TreeShape::from_json(r#"{"0": [{"1": [3, 4]}, {"2": [5, 6]}]}"#).unwrap(),
            None,
        );
        let tree = &harness.tree;
        assert_eq!(tree.root_id(), 0);
        assert_eq!(tree.node_ids(), vec![0, 1, 3, 4, 2, 5, 6]);
        assert_eq!(tree.children_of(2), vec![5, 6]);
        assert_eq!(tree.parent_of(5), Some(2));
        assert_eq!(tree.parent_of(0), None);
        assert_eq!(tree.depth_of(6), Some(3));
        assert_eq!(tree.is_leaf(1), Some(false));
        assert_eq!(tree.is_leaf(4), Some(true));
        assert_eq!(tree.to_string(), "[0, [[1, [[3, []],[4, []]]],[2, [[5, []],[6, []]]]]]");
    }

    #[test]
    fn duplicate_ids_fail_construction() {
        let (_, tree_in) = link();
        let (tree_out, _) = link();
        let result = SchedulingTree::new(
            &TreeShape::two_level(0, [1, 0]),
            None,
            PifoTiming::default(),
            Shutdown::new(),
            tree_in,
            tree_out,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateNode(0))));
    }

    #[test]
    fn enqueue_walk_writes_pointers_up_to_root() {
        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), None);
        h.enqueue(1, 2, vec![5, 0]).unwrap();
        assert_eq!(h.tree.len_of(2), Some(1));
        assert_eq!(h.tree.len_of(1), Some(0));
        assert_eq!(h.tree.len_of(0), Some(1));
    }

    #[test]
    fn root_rank_decides_between_leaves() {
        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), None);
        // Leaf ranks favour leaf 1; root ranks favour leaf 2.
        h.enqueue(10, 1, vec![0, 9]).unwrap();
        h.enqueue(20, 2, vec![50, 1]).unwrap();
        h.enqueue(21, 2, vec![40, 2]).unwrap();
        assert_eq!(h.dequeue(), Some(21));
        assert_eq!(h.dequeue(), Some(20));
        assert_eq!(h.dequeue(), Some(10));
    }

    #[test]
    fn dequeue_blocks_until_data_then_delivers() {
        let mut h = Harness::new(TreeShape::node(0, vec![]), None);
        assert_eq!(h.dequeue(), None);
        h.enqueue(3, 0, vec![1]).unwrap();
        // The outstanding read from before is served as soon as the packet lands.
        assert!(matches!(h.egress.poll_data(), Recv::Item((_, p)) if p.id == 3));
    }

    #[test]
    fn wrong_rank_vector_length_is_fatal() {
        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), None);
        let err = h.enqueue(1, 1, vec![3]).unwrap_err();
        assert!(matches!(
            err,
            SimError::Integrity {
                source: IntegrityError::RankVectorMismatch { ranks: 1, depth: 2, .. },
                ..
            }
        ));
    }

    #[test]
    fn packets_cannot_target_internal_or_unknown_nodes() {
        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), None);
        assert!(matches!(
            h.enqueue(1, 0, vec![3]).unwrap_err(),
            SimError::Integrity {
                source: IntegrityError::NotALeaf { node: 0, .. },
                ..
            }
        ));

        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), None);
        assert!(matches!(
            h.enqueue(1, 9, vec![3, 3]).unwrap_err(),
            SimError::Integrity {
                source: IntegrityError::UnknownLeaf { node: 9, .. },
                ..
            }
        ));
    }

    #[test]
    fn bounded_leaf_counts_evictions() {
        let mut h = Harness::new(TreeShape::node(0, vec![]), Some(2));
        h.enqueue(1, 0, vec![10]).unwrap();
        h.enqueue(2, 0, vec![30]).unwrap();
        h.enqueue(3, 0, vec![20]).unwrap();
        assert_eq!(h.tree.len_of(0), Some(2));
        assert_eq!(h.tree.drop_counts()[&0], 1);
        assert_eq!(h.tree.dropped_packets(), 1);
        assert_eq!(h.dequeue(), Some(1));
        assert_eq!(h.dequeue(), Some(3));
    }

    #[test]
    fn bounded_tree_keeps_pointers_in_step_with_leaves() {
        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), Some(1));
        h.enqueue(1, 1, vec![5, 0]).unwrap();
        h.enqueue(2, 1, vec![3, 0]).unwrap();
        h.enqueue(3, 2, vec![1, 1]).unwrap();
        // Packet 1 lost its slot to packet 2; the root pointer that led to it went with it.
        assert_eq!(h.tree.len_of(1), Some(1));
        assert_eq!(h.tree.len_of(0), Some(2));
        assert_eq!(
            h.tree.drop_counts(),
            BTreeMap::from([(0, 0), (1, 1), (2, 0)])
        );
        assert_eq!(h.dequeue(), Some(2));
        assert_eq!(h.dequeue(), Some(3));
        assert_eq!(h.dequeue(), None);
    }

    #[test]
    fn evicted_newcomer_leaves_no_pointer_behind() {
        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), Some(1));
        h.enqueue(1, 1, vec![3, 0]).unwrap();
        h.enqueue(2, 1, vec![9, 0]).unwrap();
        assert_eq!(h.tree.len_of(1), Some(1));
        assert_eq!(h.tree.len_of(0), Some(1));
        assert_eq!(h.tree.dropped_packets(), 1);
        assert_eq!(h.dequeue(), Some(1));
        assert_eq!(h.dequeue(), None);
        h.enqueue(3, 2, vec![4, 4]).unwrap();
        assert!(matches!(h.egress.poll_data(), Recv::Item((_, p)) if p.id == 3));
    }

    #[test]
    fn eviction_during_a_read_cancels_the_pending_pointer() {
        let mut h = Harness::new(TreeShape::two_level(0, [1, 2]), Some(1));
        h.enqueue(1, 1, vec![3, 0]).unwrap();
        // Root pointer is popped and the leaf read is in flight when packet 2 lands.
        assert!(h.egress.grant());
        h.tick().unwrap();
        assert_eq!(h.tree.len_of(0), Some(0));
        h.enqueue(2, 1, vec![1, 0]).unwrap();
        let mut delivered = Vec::new();
        while let Recv::Item((_, p)) = h.egress.poll_data() {
            delivered.push(p.id);
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(h.tree.len_of(0), Some(0));
        assert_eq!(h.tree.len_of(1), Some(0));
    }
}
