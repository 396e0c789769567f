//! Round-robin merge of the generator outputs into the switch input.

use crate::clock::{Clock, Cycle};
use crate::error::{IntegrityError, SimError};
use crate::packet::{Metadata, Packet};
use crate::pipe::{poll, Recv};
use crate::sim::{Activity, Process};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A packet as it entered the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arrival {
    pub cycle: Cycle,
    pub meta: Metadata,
    pub packet: Packet,
}

/// Forwards at most one packet per period, visiting inputs round-robin.
///
/// Each forwarded packet is renumbered with its arrival index and recorded, which makes the
/// arbiter's record the ingress capture of the run.
pub struct Arbiter {
    inputs: Vec<Receiver<(Metadata, Packet)>>,
    output: Sender<(Metadata, Packet)>,
    next_input: usize,
    last_forward: Option<Cycle>,
    arrivals: Vec<Arrival>,
}

impl Arbiter {
    pub fn new(inputs: Vec<Receiver<(Metadata, Packet)>>, output: Sender<(Metadata, Packet)>) -> Self {
        Self {
            inputs,
            output,
            next_input: 0,
            last_forward: None,
            arrivals: Vec::new(),
        }
    }

    pub fn arrivals(&self) -> &[Arrival] {
        &self.arrivals
    }

    pub fn into_arrivals(self) -> Vec<Arrival> {
        self.arrivals
    }

    pub fn forwarded(&self) -> usize {
        self.arrivals.len()
    }

    /// True when no input holds a packet waiting to be forwarded.
    pub fn inputs_empty(&self) -> bool {
        self.inputs.iter().all(|input| input.is_empty())
    }
}

impl Process for Arbiter {
    fn name(&self) -> &'static str {
        "arbiter"
    }

    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        if self.last_forward == Some(clock.now()) || self.inputs.is_empty() {
            return Ok(Activity::Blocked);
        }
        let count = self.inputs.len();
        for offset in 0..count {
            let index = (self.next_input + offset) % count;
            let Recv::Item((meta, packet)) = poll(&self.inputs[index]) else {
                continue;
            };
            let packet = packet.with_id(self.arrivals.len() as u64);
            trace!(cycle = clock.now(), input = index, packet = packet.id, "arrival");
            let arrival = Arrival {
                cycle: clock.now(),
                meta: meta.clone(),
                packet: packet.clone(),
            };
            if self.output.send((meta, packet)).is_err() {
                return Err(SimError::integrity(
                    clock.now(),
                    IntegrityError::Disconnected {
                        stage: "arbiter",
                        pipe: "switch input",
                    },
                ));
            }
            self.arrivals.push(arrival);
            self.next_input = index + 1;
            self.last_forward = Some(clock.now());
            return Ok(Activity::Progressed);
        }
        Ok(Activity::Blocked)
    }

    fn busy(&self) -> bool {
        !self.inputs_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FiveTuple;
    use crate::pipe::Pipe;

    fn packet(flow: u16) -> (Metadata, Packet) {
        let packet = Packet::filled(999, FiveTuple::tcp(flow, 80), 10);
        (Metadata::for_packet(&packet, 1, 4), packet)
    }

    #[test]
    fn merges_round_robin_one_per_period() {
        let (a_tx, a_rx) = Pipe::new().split();
        let (b_tx, b_rx) = Pipe::new().split();
        let (out_tx, out_rx) = Pipe::new().split();
        let mut arbiter = Arbiter::new(vec![a_rx, b_rx], out_tx);
        for _ in 0..2 {
            a_tx.send(packet(0)).unwrap();
            b_tx.send(packet(1)).unwrap();
        }

        let mut clock = Clock::new(1);
        for _ in 0..6 {
            while arbiter.step(&clock).unwrap().progressed() {}
            clock.tick();
        }
        let flows: Vec<u16> = out_rx.try_iter().map(|(_, p)| p.flow_id()).collect();
        assert_eq!(flows, vec![0, 1, 0, 1]);
        let cycles: Vec<Cycle> = arbiter.arrivals().iter().map(|a| a.cycle).collect();
        assert_eq!(cycles, vec![0, 1, 2, 3]);
        let ids: Vec<u64> = arbiter.arrivals().iter().map(|a| a.packet.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(arbiter.inputs_empty());
    }

    #[test]
    fn closed_switch_input_is_an_error_and_nothing_is_recorded() {
        let (a_tx, a_rx) = Pipe::new().split();
        let (out_tx, out_rx) = Pipe::<(Metadata, Packet)>::new().split();
        drop(out_rx);
        let mut arbiter = Arbiter::new(vec![a_rx], out_tx);
        a_tx.send(packet(0)).unwrap();

        let err = arbiter.step(&Clock::new(1)).unwrap_err();
        assert!(matches!(
            err,
            SimError::Integrity {
                source: IntegrityError::Disconnected { stage: "arbiter", .. },
                ..
            }
        ));
        assert!(arbiter.arrivals().is_empty());
    }
}
