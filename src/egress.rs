//! Egress stage.
//!
//! Algorithm:
//! 1. Wait for the start-dequeue token from the orchestrator (once)
//! 2. Wait for the downstream receiver to grant a ready token
//! 3. Request one packet from the scheduling tree and wait for it
//! 4. Apply the discipline's virtual-time feedback
//! 5. Spend one period on post-processing, then push the packet downstream
//!
//! Egress is the only writer of the switch's virtual-time state.

use crate::clock::{Clock, Countdown};
use crate::error::{IntegrityError, SimError};
use crate::packet::{Metadata, Packet};
use crate::pipe::{poll, ConsumerEnd, ProducerEnd, Recv};
use crate::sim::{Activity, Process, Shutdown};
use crate::virtual_time::SharedVirtualTime;
use crossbeam_channel::Receiver;
use tracing::{debug, trace};

/// Post-processing latency in clock periods.
pub const POST_PROCESS_LATENCY: u64 = 1;

enum EgressState {
    AwaitingStart,
    Idle,
    AwaitingPacket,
    Processing {
        timer: Countdown,
        item: (Metadata, Packet),
    },
}

pub struct Egress {
    input: ConsumerEnd<(Metadata, Packet)>,
    output: ProducerEnd<(Metadata, Packet)>,
    start: Receiver<()>,
    virtual_time: SharedVirtualTime,
    shutdown: Shutdown,
    state: EgressState,
    released: u64,
}

impl Egress {
    pub fn new(
        input: ConsumerEnd<(Metadata, Packet)>,
        output: ProducerEnd<(Metadata, Packet)>,
        start: Receiver<()>,
        virtual_time: SharedVirtualTime,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            input,
            output,
            start,
            virtual_time,
            shutdown,
            state: EgressState::AwaitingStart,
            released: 0,
        }
    }

    /// Packets pushed downstream so far.
    pub fn released(&self) -> u64 {
        self.released
    }

    pub fn started(&self) -> bool {
        !matches!(self.state, EgressState::AwaitingStart)
    }
}

impl Process for Egress {
    fn name(&self) -> &'static str {
        "egress"
    }

    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = Activity::Blocked;
        loop {
            match std::mem::replace(&mut self.state, EgressState::Idle) {
                EgressState::AwaitingStart => match poll(&self.start) {
                    Recv::Item(()) => {
                        debug!(cycle = clock.now(), "dequeue started");
                        activity = Activity::Progressed;
                    }
                    Recv::Empty | Recv::Closed => {
                        self.state = EgressState::AwaitingStart;
                        return Ok(activity);
                    }
                },
                EgressState::Idle => {
                    if self.shutdown.is_requested() {
                        return Ok(activity);
                    }
                    match self.output.poll_ready() {
                        Recv::Item(_) => {
                            if !self.input.grant() {
                                return Err(disconnected(clock, "scheduling tree"));
                            }
                            self.state = EgressState::AwaitingPacket;
                            activity = Activity::Progressed;
                        }
                        Recv::Empty | Recv::Closed => return Ok(activity),
                    }
                }
                EgressState::AwaitingPacket => match self.input.poll_data() {
                    Recv::Item((meta, packet)) => {
                        if self.virtual_time.apply(&meta.sched_meta) {
                            debug!(
                                cycle = clock.now(),
                                packet = packet.id,
                                feedback = %meta.sched_meta,
                                "virtual time advanced"
                            );
                        }
                        self.state = EgressState::Processing {
                            timer: Countdown::start(clock, POST_PROCESS_LATENCY),
                            item: (meta, packet),
                        };
                        activity = Activity::Progressed;
                    }
                    Recv::Empty => {
                        self.state = EgressState::AwaitingPacket;
                        return Ok(activity);
                    }
                    Recv::Closed => return Err(disconnected(clock, "scheduling tree")),
                },
                EgressState::Processing { timer, item } => {
                    if !timer.expired(clock) {
                        self.state = EgressState::Processing { timer, item };
                        return Ok(activity);
                    }
                    trace!(cycle = clock.now(), packet = item.1.id, meta = %item.0, "released");
                    if self.output.push(item).is_err() {
                        return Err(disconnected(clock, "receiver"));
                    }
                    self.released += 1;
                    activity = Activity::Progressed;
                }
            }
        }
    }

    fn busy(&self) -> bool {
        matches!(self.state, EgressState::Processing { .. })
    }
}

fn disconnected(clock: &Clock, pipe: &'static str) -> SimError {
    SimError::integrity(
        clock.now(),
        IntegrityError::Disconnected {
            stage: "egress",
            pipe,
        },
    )
}
