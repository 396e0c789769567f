//! PIFO (push-in first-out) queues.
//!
//! [`PifoQueue`] is the storage: a bounded priority queue keyed by rank with FIFO tie-breaking and
//! max-rank eviction. [`PifoNode`] wraps it in two independent state machines, one servicing write
//! requests and one servicing read requests, each with its own configured latency.

use crate::clock::{Clock, Countdown};
use crate::error::{IntegrityError, SimError};
use crate::packet::{NodeId, Rank};
use crate::pipe::{poll, Pipe, Recv};
use crate::sim::{Activity, Process, Shutdown};
use crossbeam_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Bounded min-rank queue.
///
/// Entries are keyed by `(rank, sequence)`. The sequence number grows with every insertion, so
/// entries of equal rank leave in the order they arrived. When a push exceeds the capacity, the
/// entry with the largest key across the whole queue is evicted, which may be an older entry
/// rather than the one just pushed.
#[derive(Debug, Clone)]
pub struct PifoQueue<T> {
    entries: BTreeMap<(Rank, u64), T>,
    next_seq: u64,
    capacity: Option<usize>,
    drop_count: u64,
}

impl<T> PifoQueue<T> {
    /// Create a queue. `None` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
            capacity,
            drop_count: 0,
        }
    }

    /// Insert an entry, returning whatever was evicted to respect the capacity bound.
    pub fn push(&mut self, rank: Rank, item: T) -> Option<(Rank, T)> {
        self.entries.insert((rank, self.next_seq), item);
        self.next_seq += 1;

        let capacity = self.capacity?;
        if self.entries.len() <= capacity {
            return None;
        }
        let ((evicted_rank, _), evicted) = self.entries.pop_last()?;
        self.drop_count += 1;
        Some((evicted_rank, evicted))
    }

    /// Remove the entry with the smallest rank (oldest first among equals).
    pub fn pop(&mut self) -> Option<(Rank, T)> {
        self.entries
            .pop_first()
            .map(|((rank, _), item)| (rank, item))
    }

    /// Remove the highest-keyed entry satisfying `pred`, leaving the drop counter alone.
    pub fn remove_last_matching(&mut self, pred: impl Fn(&T) -> bool) -> Option<(Rank, T)> {
        let key = self
            .entries
            .iter()
            .rev()
            .find(|(_, item)| pred(item))
            .map(|(key, _)| *key)?;
        self.entries.remove(&key).map(|item| (key.0, item))
    }

    pub fn peek_rank(&self) -> Option<Rank> {
        self.entries.first_key_value().map(|((rank, _), _)| *rank)
    }

    pub fn max_rank(&self) -> Option<Rank> {
        self.entries.last_key_value().map(|((rank, _), _)| *rank)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Entries evicted so far.
    pub fn drop_count(&self) -> u64 {
        self.drop_count
    }
}

/// Latency configuration shared by every node of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PifoTiming {
    pub write_latency: u64,
    pub read_latency: u64,
}

impl Default for PifoTiming {
    fn default() -> Self {
        Self {
            write_latency: 1,
            read_latency: 1,
        }
    }
}

/// Requester-side handle to a [`PifoNode`].
pub struct PifoPort<T> {
    write_req: Sender<(Rank, T)>,
    write_done: Receiver<()>,
    read_req: Sender<()>,
    read_data: Receiver<(Rank, T)>,
}

impl<T> PifoPort<T> {
    /// Issue a write request. Returns `false` if the node has gone away.
    pub fn write(&self, rank: Rank, item: T) -> bool {
        self.write_req.send((rank, item)).is_ok()
    }

    /// Poll for the acknowledgement of the outstanding write.
    pub fn poll_write_done(&self) -> Recv<()> {
        poll(&self.write_done)
    }

    /// Issue a read request. Returns `false` if the node has gone away.
    pub fn read(&self) -> bool {
        self.read_req.send(()).is_ok()
    }

    /// Poll for the response to the outstanding read.
    pub fn poll_read_data(&self) -> Recv<(Rank, T)> {
        poll(&self.read_data)
    }
}

struct PendingWrite<T> {
    timer: Countdown,
    rank: Rank,
    item: T,
}

/// A PIFO with independent write and read state machines.
///
/// The write machine accepts one request at a time, commits it after `write_latency` periods and
/// acknowledges it exactly once. The read machine pops the minimum entry after `read_latency`
/// periods; if the queue is empty at that point it re-checks every period until data shows up.
pub struct PifoNode<T> {
    id: NodeId,
    queue: PifoQueue<T>,
    timing: PifoTiming,
    shutdown: Shutdown,
    write_req: Receiver<(Rank, T)>,
    write_done: Sender<()>,
    read_req: Receiver<()>,
    read_data: Sender<(Rank, T)>,
    pending_write: Option<PendingWrite<T>>,
    pending_read: Option<Countdown>,
    unreported_evictions: u64,
}

impl<T> PifoNode<T> {
    /// Build a node and the port used to talk to it.
    pub fn new(
        id: NodeId,
        capacity: Option<usize>,
        timing: PifoTiming,
        shutdown: Shutdown,
    ) -> (PifoNode<T>, PifoPort<T>) {
        let (write_req_tx, write_req_rx) = Pipe::new().split();
        let (write_done_tx, write_done_rx) = Pipe::new().split();
        let (read_req_tx, read_req_rx) = Pipe::new().split();
        let (read_data_tx, read_data_rx) = Pipe::new().split();
        let node = PifoNode {
            id,
            queue: PifoQueue::new(capacity),
            timing,
            shutdown,
            write_req: write_req_rx,
            write_done: write_done_tx,
            read_req: read_req_rx,
            read_data: read_data_tx,
            pending_write: None,
            pending_read: None,
            unreported_evictions: 0,
        };
        let port = PifoPort {
            write_req: write_req_tx,
            write_done: write_done_rx,
            read_req: read_req_tx,
            read_data: read_data_rx,
        };
        (node, port)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drop_count(&self) -> u64 {
        self.queue.drop_count()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.queue.capacity()
    }

    /// Evictions since the last call.
    pub fn take_evictions(&mut self) -> u64 {
        std::mem::take(&mut self.unreported_evictions)
    }

    /// Pull out the highest-ranked committed entry matching `pred`.
    pub fn retract(&mut self, pred: impl Fn(&T) -> bool) -> Option<Rank> {
        self.queue.remove_last_matching(pred).map(|(rank, _)| rank)
    }

    fn step_write(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = Activity::Blocked;
        loop {
            match self.pending_write.take() {
                None => {
                    if self.shutdown.is_requested() {
                        return Ok(activity);
                    }
                    match poll(&self.write_req) {
                        Recv::Item((rank, item)) => {
                            self.pending_write = Some(PendingWrite {
                                timer: Countdown::start(clock, self.timing.write_latency),
                                rank,
                                item,
                            });
                            activity = Activity::Progressed;
                        }
                        Recv::Empty | Recv::Closed => return Ok(activity),
                    }
                }
                Some(write) if write.timer.expired(clock) => {
                    if let Some((evicted_rank, _)) = self.queue.push(write.rank, write.item) {
                        self.unreported_evictions += 1;
                        debug!(
                            node = self.id,
                            rank = write.rank,
                            evicted_rank,
                            drops = self.queue.drop_count(),
                            "queue full, evicted max-rank entry"
                        );
                    }
                    trace!(node = self.id, rank = write.rank, len = self.queue.len(), "write committed");
                    if self.write_done.send(()).is_err() {
                        return Err(SimError::integrity(
                            clock.now(),
                            IntegrityError::Disconnected {
                                stage: "pifo",
                                pipe: "write ack",
                            },
                        ));
                    }
                    activity = Activity::Progressed;
                }
                Some(write) => {
                    self.pending_write = Some(write);
                    return Ok(activity);
                }
            }
        }
    }

    fn step_read(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = Activity::Blocked;
        loop {
            match self.pending_read {
                None => {
                    if self.shutdown.is_requested() {
                        return Ok(activity);
                    }
                    match poll(&self.read_req) {
                        Recv::Item(()) => {
                            self.pending_read =
                                Some(Countdown::start(clock, self.timing.read_latency));
                            activity = Activity::Progressed;
                        }
                        Recv::Empty | Recv::Closed => return Ok(activity),
                    }
                }
                Some(timer) if timer.expired(clock) => match self.queue.pop() {
                    Some((rank, item)) => {
                        trace!(node = self.id, rank, len = self.queue.len(), "read served");
                        self.pending_read = None;
                        if self.read_data.send((rank, item)).is_err() {
                            return Err(SimError::integrity(
                                clock.now(),
                                IntegrityError::Disconnected {
                                    stage: "pifo",
                                    pipe: "read data",
                                },
                            ));
                        }
                        activity = Activity::Progressed;
                    }
                    None => {
                        // Empty is transient: look again next period.
                        self.pending_read = Some(Countdown::start(clock, 1));
                        return Ok(activity);
                    }
                },
                Some(_) => return Ok(activity),
            }
        }
    }
}

impl<T> Process for PifoNode<T> {
    fn name(&self) -> &'static str {
        "pifo"
    }

    /// Write machine first, so a write committing this period is visible to a read due now.
    fn step(&mut self, clock: &Clock) -> Result<Activity, SimError> {
        let mut activity = self.step_write(clock)?;
        activity |= self.step_read(clock)?;
        Ok(activity)
    }

    fn busy(&self) -> bool {
        self.pending_write.is_some() || (self.pending_read.is_some() && !self.queue.is_empty())
    }
}
