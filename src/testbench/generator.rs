//! Rate-shaped packet generator, one per flow.

use crate::clock::{Clock, Cycle, NS_PER_CYCLE};
use crate::error::SimError;
use crate::packet::{FlowId, Metadata, Packet};
use crate::sim::{Activity, Process};
use crossbeam_channel::Sender;
use tracing::debug;

/// Clock periods needed to put `bytes` on a link of `gbps`.
pub fn serialization_periods(bytes: usize, gbps: f64) -> f64 {
    (bytes as f64 * 8.0) / gbps / NS_PER_CYCLE
}

/// Emission limits; the generator stops at whichever is hit first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub packets: Option<u64>,
    pub cycles: Option<Cycle>,
}

/// `size` back-to-back packets at the configured rate, then `delay` idle periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Burst {
    pub size: u64,
    pub delay: u64,
}

/// Emits copies of a template packet at a fixed rate in Gbps.
///
/// Inter-packet gaps are tracked with a fractional accumulator, so the long-run rate is exact even
/// when the gap is not a whole number of periods. At most one packet leaves per period; faster
/// rates saturate at that.
pub struct PacketGenerator {
    flow: FlowId,
    template: (Metadata, Packet),
    output: Sender<(Metadata, Packet)>,
    gap: f64,
    next_at: f64,
    limits: Limits,
    burst: Option<Burst>,
    sent: u64,
    last_emit: Option<Cycle>,
    done: bool,
}

impl PacketGenerator {
    pub fn new(
        template: (Metadata, Packet),
        rate_gbps: f64,
        limits: Limits,
        output: Sender<(Metadata, Packet)>,
    ) -> Self {
        let flow = template.1.flow_id();
        let gap = serialization_periods(template.1.len(), rate_gbps);
        Self {
            flow,
            template,
            output,
            gap,
            next_at: 0.0,
            limits,
            burst: None,
            sent: 0,
            last_emit: None,
            done: false,
        }
    }

    pub fn with_burst(mut self, burst: Option<Burst>) -> Self {
        self.burst = burst.filter(|burst| burst.size > 0);
        self
    }

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn limit_reached(&self, clock: &Clock) -> bool {
        self.limits.packets.is_some_and(|limit| self.sent >= limit)
            || self
                .limits
                .cycles
                .is_some_and(|limit| clock.periods_elapsed() >= limit)
    }
}

impl Process for PacketGenerator {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        if self.done {
            return Ok(Activity::Blocked);
        }
        if self.limit_reached(clock) {
            debug!(flow = self.flow, sent = self.sent, cycle = clock.now(), "generator finished");
            self.done = true;
            return Ok(Activity::Progressed);
        }
        if self.last_emit == Some(clock.now())
            || (clock.periods_elapsed() as f64) < self.next_at
        {
            return Ok(Activity::Blocked);
        }
        if self.output.send(self.template.clone()).is_err() {
            // Arbiter gone: nothing left to feed.
            self.done = true;
            return Ok(Activity::Progressed);
        }
        self.sent += 1;
        self.last_emit = Some(clock.now());
        self.next_at += self.gap;
        if let Some(burst) = self.burst {
            if self.sent % burst.size == 0 {
                self.next_at += burst.delay as f64;
            }
        }
        Ok(Activity::Progressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FiveTuple;
    use crate::pipe::Pipe;

    fn template(payload: usize) -> (Metadata, Packet) {
        let packet = Packet::filled(0, FiveTuple::tcp(3, 80), payload);
        (Metadata::for_packet(&packet, 1, 4), packet)
    }

    fn emission_cycles(mut generator: PacketGenerator, periods: u64) -> Vec<Cycle> {
        let mut clock = Clock::new(1);
        let mut cycles = Vec::new();
        for _ in 0..periods {
            while generator.step(&clock).unwrap().progressed() {
                if cycles.len() < generator.sent() as usize {
                    cycles.push(clock.now());
                }
            }
            clock.tick();
        }
        cycles
    }

    #[test]
    fn serialization_time_matches_link_rate() {
        // 125 bytes = 1000 bits = 100 ns at 10 Gbps = 20 periods.
        assert!((serialization_periods(125, 10.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn emits_at_configured_rate_until_packet_limit() {
        let (tx, rx) = Pipe::new().split();
        // 71 payload + 54 header = 125 bytes, 20 periods apart at 10 Gbps.
        let generator = PacketGenerator::new(
            template(71),
            10.0,
            Limits {
                packets: Some(4),
                cycles: None,
            },
            tx,
        );
        let cycles = emission_cycles(generator, 200);
        assert_eq!(cycles, vec![0, 20, 40, 60]);
        assert_eq!(rx.len(), 4);
    }

    #[test]
    fn cycle_limit_stops_emission() {
        let (tx, _rx) = Pipe::new().split();
        let generator = PacketGenerator::new(
            template(71),
            10.0,
            Limits {
                packets: None,
                cycles: Some(50),
            },
            tx,
        );
        assert_eq!(emission_cycles(generator, 200), vec![0, 20, 40]);
    }

    #[test]
    fn bursts_insert_idle_gaps() {
        let (tx, _rx) = Pipe::new().split();
        let generator = PacketGenerator::new(
            template(71),
            10.0,
            Limits {
                packets: Some(4),
                cycles: None,
            },
            tx,
        )
        .with_burst(Some(Burst { size: 2, delay: 100 }));
        assert_eq!(emission_cycles(generator, 400), vec![0, 20, 140, 160]);
    }

    #[test]
    fn rates_beyond_one_packet_per_period_saturate() {
        let (tx, rx) = Pipe::new().split();
        let generator = PacketGenerator::new(
            template(10),
            10_000.0,
            Limits {
                packets: Some(5),
                cycles: None,
            },
            tx,
        );
        assert_eq!(emission_cycles(generator, 10), vec![0, 1, 2, 3, 4]);
        assert_eq!(rx.len(), 5);
    }
}
