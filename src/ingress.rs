//! Ingress stage.
//!
//! Takes `(metadata, packet)` pairs off the switch input, runs the rank engine on each one,
//! spends one clock period doing so, then waits for the scheduling tree's ready token before
//! handing the packet over. The level-0 rank of every packet is also published on an optional
//! trace channel so the orchestrator can persist it next to the ingress capture.

use crate::clock::{Clock, Countdown, Cycle};
use crate::error::{IntegrityError, SimError};
use crate::packet::{FlowId, Metadata, Packet, Rank};
use crate::pipe::{poll, ProducerEnd, Recv};
use crate::scheduler::RankEngine;
use crate::sim::{Activity, Process, Shutdown};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Rank computation latency in clock periods.
pub const RANK_LATENCY: u64 = 1;

/// Level-0 rank assigned to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    pub cycle: Cycle,
    pub packet: u64,
    pub flow: FlowId,
    pub rank: Rank,
}

enum IngressState {
    Idle,
    Computing {
        timer: Countdown,
        item: (Metadata, Packet),
    },
    AwaitingReady {
        item: (Metadata, Packet),
    },
}

pub struct Ingress {
    engine: RankEngine,
    input: Receiver<(Metadata, Packet)>,
    output: ProducerEnd<(Metadata, Packet)>,
    rank_trace: Option<Sender<RankRecord>>,
    shutdown: Shutdown,
    state: IngressState,
    ranked: u64,
}

impl Ingress {
    pub fn new(
        engine: RankEngine,
        input: Receiver<(Metadata, Packet)>,
        output: ProducerEnd<(Metadata, Packet)>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            engine,
            input,
            output,
            rank_trace: None,
            shutdown,
            state: IngressState::Idle,
            ranked: 0,
        }
    }

    /// Publish every computed level-0 rank on `trace`.
    pub fn with_rank_trace(mut self, trace: Sender<RankRecord>) -> Self {
        self.rank_trace = Some(trace);
        self
    }

    pub fn engine(&self) -> &RankEngine {
        &self.engine
    }

    /// Packets ranked so far.
    pub fn ranked(&self) -> u64 {
        self.ranked
    }

    fn publish(&mut self, clock: &Clock, meta: &Metadata, packet: &Packet) {
        let Some(sender) = &self.rank_trace else {
            return;
        };
        let record = RankRecord {
            cycle: clock.now(),
            packet: packet.id,
            flow: packet.flow_id(),
            rank: meta.ranks.first().copied().unwrap_or_default(),
        };
        if sender.send(record).is_err() {
            // Nobody is listening any more.
            self.rank_trace = None;
        }
    }
}

impl Process for Ingress {
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = Activity::Blocked;
        loop {
            match std::mem::replace(&mut self.state, IngressState::Idle) {
                IngressState::Idle => {
                    if self.shutdown.is_requested() {
                        return Ok(activity);
                    }
                    match poll(&self.input) {
                        Recv::Item((mut meta, packet)) => {
                            self.engine.rank(&packet, &mut meta, clock);
                            self.ranked += 1;
                            trace!(
                                cycle = clock.now(),
                                packet = packet.id,
                                flow = packet.flow_id(),
                                ranks = ?meta.ranks,
                                leaf = meta.leaf_node,
                                "ranked"
                            );
                            self.publish(clock, &meta, &packet);
                            self.state = IngressState::Computing {
                                timer: Countdown::start(clock, RANK_LATENCY),
                                item: (meta, packet),
                            };
                            activity = Activity::Progressed;
                        }
                        Recv::Empty | Recv::Closed => return Ok(activity),
                    }
                }
                IngressState::Computing { timer, item } => {
                    if !timer.expired(clock) {
                        self.state = IngressState::Computing { timer, item };
                        return Ok(activity);
                    }
                    self.state = IngressState::AwaitingReady { item };
                    activity = Activity::Progressed;
                }
                IngressState::AwaitingReady { item } => match self.output.poll_ready() {
                    Recv::Item(_) => {
                        if self.output.push(item).is_err() {
                            return Err(disconnected(clock));
                        }
                        activity = Activity::Progressed;
                    }
                    Recv::Empty => {
                        self.state = IngressState::AwaitingReady { item };
                        return Ok(activity);
                    }
                    Recv::Closed => return Err(disconnected(clock)),
                },
            }
        }
    }

    fn busy(&self) -> bool {
        !matches!(self.state, IngressState::Idle)
    }
}

fn disconnected(clock: &Clock) -> SimError {
    SimError::integrity(
        clock.now(),
        IntegrityError::Disconnected {
            stage: "ingress",
            pipe: "scheduling tree",
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlgorithmConfig, TreeShape};
    use crate::packet::FiveTuple;
    use crate::pipe::{link, ConsumerEnd, Pipe};
    use crate::virtual_time::SharedVirtualTime;

    fn ingress() -> (
        Ingress,
        Sender<(Metadata, Packet)>,
        ConsumerEnd<(Metadata, Packet)>,
        Receiver<RankRecord>,
    ) {
        let engine = RankEngine::new(
            &AlgorithmConfig::Invert { max_rank: 100 },
            &TreeShape::leaf(0),
            SharedVirtualTime::default(),
        )
        .unwrap();
        let (tx, rx) = Pipe::new().split();
        let (producer, consumer) = link();
        let (trace_tx, trace_rx) = Pipe::new().split();
        let ingress = Ingress::new(engine, rx, producer, Shutdown::new()).with_rank_trace(trace_tx);
        (ingress, tx, consumer, trace_rx)
    }

    fn arrival(id: u64) -> (Metadata, Packet) {
        let packet = Packet::filled(id, FiveTuple::tcp(0, 80), 10);
        (Metadata::for_packet(&packet, 1, 4), packet)
    }

    #[test]
    fn ranking_takes_one_period_then_waits_for_ready() {
        let (mut ingress, tx, tree, trace) = ingress();
        let mut clock = Clock::new(1);
        tx.send(arrival(0)).unwrap();

        assert!(ingress.step(&clock).unwrap().progressed());
        assert!(ingress.busy());
        assert_eq!(tree.poll_data(), Recv::Empty);

        clock.tick();
        ingress.step(&clock).unwrap();
        // Rank is ready but the tree has not granted a token yet.
        assert_eq!(tree.poll_data(), Recv::Empty);

        assert!(tree.grant());
        ingress.step(&clock).unwrap();
        match tree.poll_data() {
            Recv::Item((meta, packet)) => {
                assert_eq!(packet.id, 0);
                assert_eq!(meta.ranks, vec![100]);
            }
            other => panic!("expected a packet, got {other:?}"),
        }
        assert!(!ingress.busy());
        assert_eq!(
            poll(&trace),
            Recv::Item(RankRecord {
                cycle: 0,
                packet: 0,
                flow: 0,
                rank: 100
            })
        );
    }

    #[test]
    fn one_packet_per_period_at_most() {
        let (mut ingress, tx, tree, _trace) = ingress();
        let mut clock = Clock::new(1);
        for id in 0..3 {
            tx.send(arrival(id)).unwrap();
            assert!(tree.grant());
        }
        let mut delivered = Vec::new();
        for _ in 0..4 {
            while ingress.step(&clock).unwrap().progressed() {}
            while let Recv::Item((_, packet)) = tree.poll_data() {
                delivered.push((clock.now(), packet.id));
            }
            clock.tick();
        }
        assert_eq!(delivered, vec![(1, 0), (2, 1), (3, 2)]);
        assert_eq!(ingress.ranked(), 3);
    }

    #[test]
    fn shutdown_stops_taking_new_packets() {
        let (mut ingress, tx, _tree, _trace) = ingress();
        let shutdown = ingress.shutdown.clone();
        shutdown.request();
        tx.send(arrival(0)).unwrap();
        assert_eq!(ingress.step(&Clock::default()).unwrap(), Activity::Blocked);
        assert_eq!(ingress.ranked(), 0);
    }
}
