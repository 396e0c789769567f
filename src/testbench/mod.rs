//! Test bench around one switch.
//!
//! A [`Scenario`] describes the traffic (one rate-shaped generator per flow), the egress link
//! rate, when dequeueing may start and how long to wait for the switch to drain. [`Testbench`]
//! wires generators → arbiter → switch → receiver, watches for completion and then raises the
//! simulation-done flag so every stage winds down.
//!
//! Step order within a period: generators in flow order, arbiter, switch, receiver, watcher.

pub mod arbiter;
pub mod capture;
pub mod generator;
pub mod presets;
pub mod receiver;

use crate::clock::{Clock, Cycle};
use crate::config::{SchedAlg, SwitchConfig};
use crate::error::{ConfigError, SimError};
use crate::ingress::RankRecord;
use crate::metrics::{FlowStats, FlowSummary, RATE_AVG_INTERVAL_NS};
use crate::packet::{FiveTuple, FlowId, Metadata, NodeId, Packet};
use crate::pipe::Pipe;
use crate::sim::{Activity, Process, Shutdown, Simulator, DEFAULT_CYCLE_LIMIT};
use crate::switch::Switch;
use arbiter::{Arbiter, Arrival};
use crossbeam_channel::{Receiver, Sender};
use generator::{Burst, Limits, PacketGenerator};
use receiver::{Departure, PacketReceiver};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Switch ingress port bitmap stamped on generated packets.
pub const INGRESS_PORT: u8 = 0b0000_0001;
/// Switch egress port bitmap stamped on generated packets.
pub const EGRESS_PORT: u8 = 0b0000_0100;

fn default_payload() -> usize {
    10
}

fn default_egress_rate() -> f64 {
    10.0
}

fn default_timeout() -> Cycle {
    100_000
}

fn default_cycle_limit() -> Cycle {
    DEFAULT_CYCLE_LIMIT
}

fn default_period() -> Cycle {
    1
}

/// One generated flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Source port, which is also the flow ID.
    pub flow: FlowId,
    pub rate_gbps: f64,
    #[serde(default = "default_payload")]
    pub payload_bytes: usize,
    #[serde(default)]
    pub pkt_limit: Option<u64>,
    #[serde(default)]
    pub cycle_limit: Option<Cycle>,
    #[serde(default)]
    pub burst_size: Option<u64>,
    #[serde(default)]
    pub burst_delay: u64,
}

impl FlowSpec {
    pub fn new(flow: FlowId, rate_gbps: f64) -> Self {
        Self {
            flow,
            rate_gbps,
            payload_bytes: default_payload(),
            pkt_limit: None,
            cycle_limit: None,
            burst_size: None,
            burst_delay: 0,
        }
    }

    pub fn pkt_limit(mut self, limit: u64) -> Self {
        self.pkt_limit = Some(limit);
        self
    }

    pub fn cycle_limit(mut self, limit: Cycle) -> Self {
        self.cycle_limit = Some(limit);
        self
    }

    pub fn burst(mut self, size: u64, delay: u64) -> Self {
        self.burst_size = Some(size);
        self.burst_delay = delay;
        self
    }

    /// Packet and metadata every emission of this flow copies.
    pub fn template(&self) -> (Metadata, Packet) {
        let packet = Packet::filled(0, FiveTuple::tcp(self.flow, 80), self.payload_bytes);
        let meta = Metadata::for_packet(&packet, INGRESS_PORT, EGRESS_PORT);
        (meta, packet)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate_gbps > 0.0) {
            return Err(ConfigError::InvalidScenario(format!(
                "flow {} needs a positive rate, got {}",
                self.flow, self.rate_gbps
            )));
        }
        if self.pkt_limit.is_none() && self.cycle_limit.is_none() {
            return Err(ConfigError::InvalidScenario(format!(
                "flow {} needs a packet limit or a cycle limit",
                self.flow
            )));
        }
        Ok(())
    }
}

/// When the egress stage may start pulling packets out of the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum StartDequeue {
    #[default]
    Immediately,
    /// `delay` periods after every generated packet has entered the switch.
    AfterInput { delay: Cycle },
}

/// Output order the run is checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    #[default]
    None,
    InputOrder,
    ReversedInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub switch: SwitchConfig,
    pub flows: Vec<FlowSpec>,
    #[serde(default = "default_egress_rate")]
    pub egress_rate_gbps: f64,
    #[serde(default)]
    pub start_dequeue: StartDequeue,
    /// Periods without a new departure after which draining is abandoned.
    #[serde(default = "default_timeout")]
    pub completion_timeout: Cycle,
    #[serde(default = "default_cycle_limit")]
    pub cycle_limit: Cycle,
    /// Time units per clock period.
    #[serde(default = "default_period")]
    pub period: Cycle,
    #[serde(default)]
    pub expect: Expectation,
}

impl Scenario {
    pub fn new(name: impl Into<String>, switch: SwitchConfig, flows: Vec<FlowSpec>) -> Self {
        Self {
            name: name.into(),
            switch,
            flows,
            egress_rate_gbps: default_egress_rate(),
            start_dequeue: StartDequeue::default(),
            completion_timeout: default_timeout(),
            cycle_limit: default_cycle_limit(),
            period: default_period(),
            expect: Expectation::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let scenario: Scenario = serde_json::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.switch.validate()?;
        if self.flows.is_empty() {
            return Err(ConfigError::InvalidScenario("no flows".to_string()));
        }
        if !(self.egress_rate_gbps > 0.0) {
            return Err(ConfigError::InvalidScenario(format!(
                "egress rate must be positive, got {}",
                self.egress_rate_gbps
            )));
        }
        self.flows.iter().try_for_each(FlowSpec::validate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Generating,
    Draining { last_received: usize, since: Cycle },
    Done,
}

/// Generators, arbiter, switch and receiver for one scenario.
pub struct Testbench {
    name: String,
    expect: Expectation,
    start_dequeue: StartDequeue,
    completion_timeout: Cycle,
    generators: Vec<PacketGenerator>,
    arbiter: Arbiter,
    switch: Switch,
    receiver: PacketReceiver,
    start_tx: Sender<()>,
    rank_trace: Receiver<RankRecord>,
    started: bool,
    input_done_at: Option<Cycle>,
    phase: Phase,
    timed_out: bool,
    shutdown: Shutdown,
}

impl Testbench {
    pub fn new(scenario: &Scenario, shutdown: Shutdown) -> Result<Self, ConfigError> {
        scenario.validate()?;
        let (switch, io) = Switch::new(&scenario.switch, shutdown.clone())?;

        let mut generators = Vec::with_capacity(scenario.flows.len());
        let mut inputs = Vec::with_capacity(scenario.flows.len());
        for flow in &scenario.flows {
            let (tx, rx) = Pipe::new().split();
            let limits = Limits {
                packets: flow.pkt_limit,
                cycles: flow.cycle_limit,
            };
            let burst = flow.burst_size.map(|size| Burst {
                size,
                delay: flow.burst_delay,
            });
            generators.push(
                PacketGenerator::new(flow.template(), flow.rate_gbps, limits, tx)
                    .with_burst(burst),
            );
            inputs.push(rx);
        }

        let mut bench = Self {
            name: scenario.name.clone(),
            expect: scenario.expect,
            start_dequeue: scenario.start_dequeue,
            completion_timeout: scenario.completion_timeout,
            generators,
            arbiter: Arbiter::new(inputs, io.pkt_in),
            switch,
            receiver: PacketReceiver::new(io.pkt_out, scenario.egress_rate_gbps),
            start_tx: io.start_dequeue,
            rank_trace: io.rank_trace,
            started: false,
            input_done_at: None,
            phase: Phase::Generating,
            timed_out: false,
            shutdown,
        };
        if bench.start_dequeue == StartDequeue::Immediately {
            bench.send_start();
        }
        Ok(bench)
    }

    pub fn switch(&self) -> &Switch {
        &self.switch
    }

    pub fn arrivals(&self) -> &[Arrival] {
        self.arbiter.arrivals()
    }

    pub fn departures(&self) -> &[Departure] {
        self.receiver.departures()
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    fn send_start(&mut self) {
        if !self.started && self.start_tx.send(()).is_ok() {
            self.started = true;
        }
    }

    /// Every generated packet has been ranked and written into the tree.
    fn input_finished(&self) -> bool {
        self.generators.iter().all(PacketGenerator::is_done)
            && self.arbiter.inputs_empty()
            && self.switch.ingress().ranked() as usize >= self.arbiter.forwarded()
            && !self.switch.ingress().busy()
            && !self.switch.tree().busy()
    }

    /// Completion watcher: start dequeueing when due, then wait until every packet is accounted
    /// for (received or evicted at a leaf) or the switch stops producing.
    fn watch(&mut self, clock: &Clock) -> Activity {
        let now = clock.periods_elapsed();
        let mut activity = Activity::Blocked;

        if self.input_done_at.is_none() && self.input_finished() {
            self.input_done_at = Some(now);
            info!(
                bench = %self.name,
                cycle = clock.now(),
                packets = self.arbiter.forwarded(),
                "all packets generated"
            );
            activity = Activity::Progressed;
        }
        if let (StartDequeue::AfterInput { delay }, Some(done_at)) =
            (self.start_dequeue, self.input_done_at)
        {
            if !self.started && now >= done_at + delay {
                debug!(cycle = clock.now(), "starting dequeue");
                self.send_start();
                activity = Activity::Progressed;
            }
        }

        match self.phase {
            Phase::Generating => {
                if self.input_done_at.is_some() && self.started {
                    self.phase = Phase::Draining {
                        last_received: self.receiver.received(),
                        since: now,
                    };
                    activity = Activity::Progressed;
                }
            }
            Phase::Draining {
                last_received,
                since,
            } => {
                let received = self.receiver.received();
                let dropped = self.switch.tree().dropped_packets() as usize;
                if received + dropped >= self.arbiter.forwarded() {
                    self.finish(clock);
                    activity = Activity::Progressed;
                } else if received != last_received {
                    self.phase = Phase::Draining {
                        last_received: received,
                        since: now,
                    };
                } else if now >= since + self.completion_timeout {
                    warn!(
                        bench = %self.name,
                        cycle = clock.now(),
                        received,
                        dropped,
                        sent = self.arbiter.forwarded(),
                        "switch stopped draining, giving up"
                    );
                    self.timed_out = true;
                    self.finish(clock);
                    activity = Activity::Progressed;
                }
            }
            Phase::Done => {}
        }
        activity
    }

    fn finish(&mut self, clock: &Clock) {
        debug!(bench = %self.name, cycle = clock.now(), "cleanup: raising simulation done");
        self.phase = Phase::Done;
        self.shutdown.request();
    }

    /// Build and run `scenario` to completion.
    pub fn run(scenario: &Scenario) -> Result<RunOutcome, SimError> {
        Self::run_with_interval(scenario, RATE_AVG_INTERVAL_NS)
    }

    /// Like [`Testbench::run`], measuring rates over `interval_ns`.
    pub fn run_with_interval(scenario: &Scenario, interval_ns: f64) -> Result<RunOutcome, SimError> {
        let shutdown = Shutdown::new();
        let mut bench = Testbench::new(scenario, shutdown.clone())?;
        let mut sim =
            Simulator::new(scenario.period, shutdown).with_cycle_limit(scenario.cycle_limit);
        let cycles = sim.run(&mut bench)?;
        Ok(bench.into_outcome(cycles, interval_ns))
    }

    fn into_outcome(self, cycles: Cycle, interval_ns: f64) -> RunOutcome {
        let ranks: Vec<RankRecord> = self.rank_trace.try_iter().collect();
        let kind = self.switch.kind();
        let drops = self.switch.drop_counts();
        let dropped = self.switch.tree().dropped_packets();
        let arrivals = self.arbiter.into_arrivals();
        let departures = self.receiver.into_departures();

        let mismatches = match self.expect {
            Expectation::None => Vec::new(),
            Expectation::InputOrder => reconcile(arrivals.iter().map(|a| &a.packet), &departures),
            Expectation::ReversedInput => {
                reconcile(arrivals.iter().rev().map(|a| &a.packet), &departures)
            }
        };
        for mismatch in &mismatches {
            warn!(bench = %self.name, %mismatch, "output mismatch");
        }

        let input = FlowStats::from_samples(
            arrivals
                .iter()
                .map(|a| (a.cycle, a.packet.flow_id(), a.packet.len())),
            interval_ns,
        );
        let output = FlowStats::from_samples(
            departures
                .iter()
                .map(|d| (d.cycle, d.packet.flow_id(), d.packet.len())),
            interval_ns,
        );

        let report = RunReport {
            name: self.name,
            algorithm: kind,
            cycles,
            sent: arrivals.len(),
            received: departures.len(),
            dropped,
            drops_per_node: drops,
            timed_out: self.timed_out,
            mismatches,
            input: input.summary(),
            output: output.summary(),
        };
        info!(
            bench = %report.name,
            algorithm = %report.algorithm,
            cycles,
            sent = report.sent,
            received = report.received,
            dropped,
            "run complete"
        );
        RunOutcome {
            report,
            arrivals,
            departures,
            ranks,
            input_stats: input,
            output_stats: output,
        }
    }
}

impl Process for Testbench {
    fn name(&self) -> &'static str {
        "testbench"
    }

    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = Activity::Blocked;
        for generator in &mut self.generators {
            activity |= generator.step(clock)?;
        }
        activity |= self.arbiter.step(clock)?;
        activity |= self.switch.step(clock)?;
        activity |= self.receiver.step(clock)?;
        activity |= self.watch(clock);
        Ok(activity)
    }

    fn busy(&self) -> bool {
        self.arbiter.busy() || self.switch.busy()
    }
}

/// Position where the received sequence differs from the expected one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub index: usize,
    pub expected: Option<u64>,
    pub received: Option<u64>,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |id: Option<u64>| id.map_or_else(|| "nothing".to_string(), |id| format!("packet {id}"));
        write!(
            f,
            "pkt {}: expected {}, received {}",
            self.index,
            show(self.expected),
            show(self.received)
        )
    }
}

/// Compare expected packets against what was received, position by position.
pub fn reconcile<'a>(
    expected: impl IntoIterator<Item = &'a Packet>,
    received: &[Departure],
) -> Vec<Mismatch> {
    let expected: Vec<&Packet> = expected.into_iter().collect();
    let len = expected.len().max(received.len());
    (0..len)
        .filter_map(|index| {
            let want = expected.get(index).copied();
            let got = received.get(index).map(|d| &d.packet);
            if want == got {
                None
            } else {
                Some(Mismatch {
                    index,
                    expected: want.map(|p| p.id),
                    received: got.map(|p| p.id),
                })
            }
        })
        .collect()
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    #[serde(with = "sched_alg_label")]
    pub algorithm: SchedAlg,
    pub cycles: Cycle,
    pub sent: usize,
    pub received: usize,
    pub dropped: u64,
    pub drops_per_node: BTreeMap<NodeId, u64>,
    pub timed_out: bool,
    pub mismatches: Vec<Mismatch>,
    pub input: Vec<FlowSummary>,
    pub output: Vec<FlowSummary>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({}) finished at cycle {}", self.name, self.algorithm, self.cycles)?;
        writeln!(f, "# input pkts = {}", self.sent)?;
        writeln!(f, "# output pkts = {}", self.received)?;
        if self.dropped > 0 {
            writeln!(f, "# dropped pkts = {} {:?}", self.dropped, self.drops_per_node)?;
        }
        if self.timed_out {
            writeln!(f, "WARNING: switch did not drain before the completion timeout")?;
        }
        for mismatch in &self.mismatches {
            writeln!(f, "ERROR: {mismatch}")?;
        }
        writeln!(f, "flow   in pkts  out pkts  out share  out Gbps")?;
        for out in &self.output {
            let sent = self
                .input
                .iter()
                .find(|input| input.flow == out.flow)
                .map_or(0, |input| input.packets);
            writeln!(
                f,
                "{:<6} {:>7}  {:>8}  {:>9.3}  {:>8.3}",
                out.flow, sent, out.packets, out.share, out.mean_gbps
            )?;
        }
        Ok(())
    }
}

mod sched_alg_label {
    use crate::config::SchedAlg;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(kind: &SchedAlg, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(kind.label())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SchedAlg, D::Error>
    where
        D: Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        label.parse().map_err(serde::de::Error::custom)
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub arrivals: Vec<Arrival>,
    pub departures: Vec<Departure>,
    pub ranks: Vec<RankRecord>,
    pub input_stats: FlowStats,
    pub output_stats: FlowStats,
}
