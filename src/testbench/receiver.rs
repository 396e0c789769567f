//! Packet sink at the switch output, paced by the egress link rate.

use super::generator::serialization_periods;
use crate::clock::{Clock, Cycle};
use crate::error::SimError;
use crate::packet::{Metadata, Packet};
use crate::pipe::{ConsumerEnd, Recv};
use crate::sim::{Activity, Process};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A packet as it left the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Departure {
    pub cycle: Cycle,
    pub meta: Metadata,
    pub packet: Packet,
}

enum ReceiverState {
    Idle,
    Waiting,
}

/// Grants one ready token, records the packet it gets, then stays busy for the packet's
/// serialization time before granting the next token.
pub struct PacketReceiver {
    input: ConsumerEnd<(Metadata, Packet)>,
    link_gbps: f64,
    free_at: f64,
    state: ReceiverState,
    departures: Vec<Departure>,
}

impl PacketReceiver {
    pub fn new(input: ConsumerEnd<(Metadata, Packet)>, link_gbps: f64) -> Self {
        Self {
            input,
            link_gbps,
            free_at: 0.0,
            state: ReceiverState::Idle,
            departures: Vec::new(),
        }
    }

    pub fn departures(&self) -> &[Departure] {
        &self.departures
    }

    pub fn into_departures(self) -> Vec<Departure> {
        self.departures
    }

    pub fn received(&self) -> usize {
        self.departures.len()
    }
}

impl Process for PacketReceiver {
    fn name(&self) -> &'static str {
        "receiver"
    }

    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let now = clock.periods_elapsed() as f64;
        match self.state {
            ReceiverState::Idle => {
                if now < self.free_at || !self.input.grant() {
                    return Ok(Activity::Blocked);
                }
                self.state = ReceiverState::Waiting;
                Ok(Activity::Progressed)
            }
            ReceiverState::Waiting => match self.input.poll_data() {
                Recv::Item((meta, packet)) => {
                    trace!(cycle = clock.now(), packet = packet.id, "received");
                    self.free_at =
                        self.free_at.max(now) + serialization_periods(packet.len(), self.link_gbps);
                    self.departures.push(Departure {
                        cycle: clock.now(),
                        meta,
                        packet,
                    });
                    self.state = ReceiverState::Idle;
                    Ok(Activity::Progressed)
                }
                Recv::Empty | Recv::Closed => Ok(Activity::Blocked),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FiveTuple;
    use crate::pipe::link;

    #[test]
    fn grants_again_only_after_serialization() {
        let (switch_out, receiver_in) = link();
        let mut receiver = PacketReceiver::new(receiver_in, 10.0);
        let mut clock = Clock::new(1);
        let mut pushed_at = Vec::new();
        let mut next_id = 0;

        for _ in 0..60 {
            while receiver.step(&clock).unwrap().progressed() {
                if let Recv::Item(_) = switch_out.poll_ready() {
                    // 71 + 54 = 125 bytes: 20 periods at 10 Gbps.
                    let packet = Packet::filled(next_id, FiveTuple::tcp(0, 80), 71);
                    switch_out
                        .push((Metadata::for_packet(&packet, 1, 4), packet))
                        .unwrap();
                    pushed_at.push(clock.now());
                    next_id += 1;
                }
            }
            clock.tick();
        }
        assert_eq!(pushed_at, vec![0, 20, 40]);
        assert_eq!(receiver.received(), 3);
        assert_eq!(receiver.departures()[2].cycle, 40);
    }
}
