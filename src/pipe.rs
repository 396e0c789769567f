//! Handshake pipes connecting independently-timed stages.
//!
//! Every producer → consumer edge is a pair of unbounded crossbeam channels: a `ready` channel the
//! consumer uses to grant permission for exactly one item, and a `data` channel the producer pushes
//! that item on. Nothing else is shared between stages, so no locks are needed on the data path.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Permission for the producer to push exactly one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready;

/// Outcome of a non-blocking receive on a pipe.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    Item(T),
    Empty,
    /// The other end has been dropped; no item will ever arrive.
    Closed,
}

impl<T> From<Result<T, TryRecvError>> for Recv<T> {
    fn from(result: Result<T, TryRecvError>) -> Self {
        match result {
            Ok(item) => Recv::Item(item),
            Err(TryRecvError::Empty) => Recv::Empty,
            Err(TryRecvError::Disconnected) => Recv::Closed,
        }
    }
}

/// Plain one-directional data pipe, as used between generators, the arbiter and ingress.
pub struct Pipe<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Pipe<T> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Split into the sending and receiving halves.
    pub fn split(self) -> (Sender<T>, Receiver<T>) {
        (self.sender, self.receiver)
    }
}

impl<T> Default for Pipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking receive that distinguishes an empty pipe from a closed one.
pub fn poll<T>(receiver: &Receiver<T>) -> Recv<T> {
    receiver.try_recv().into()
}

/// Producer half of a handshake link.
#[derive(Debug)]
pub struct ProducerEnd<T> {
    ready: Receiver<Ready>,
    data: Sender<T>,
}

/// Consumer half of a handshake link.
#[derive(Debug)]
pub struct ConsumerEnd<T> {
    ready: Sender<Ready>,
    data: Receiver<T>,
}

/// Build a fresh ready/data link.
pub fn link<T>() -> (ProducerEnd<T>, ConsumerEnd<T>) {
    let (ready_tx, ready_rx) = unbounded();
    let (data_tx, data_rx) = unbounded();
    (
        ProducerEnd {
            ready: ready_rx,
            data: data_tx,
        },
        ConsumerEnd {
            ready: ready_tx,
            data: data_rx,
        },
    )
}

impl<T> ProducerEnd<T> {
    /// Consume one ready token if the consumer has granted one.
    pub fn poll_ready(&self) -> Recv<Ready> {
        poll(&self.ready)
    }

    /// Push an item. Callers must hold a ready token obtained through [`Self::poll_ready`].
    ///
    /// Returns the item back if the consumer has gone away.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.data.send(item).map_err(|err| err.into_inner())
    }
}

impl<T> ConsumerEnd<T> {
    /// Grant the producer permission to push one item.
    ///
    /// Returns `false` if the producer has gone away.
    pub fn grant(&self) -> bool {
        self.ready.send(Ready).is_ok()
    }

    /// Take the next pushed item, if any.
    pub fn poll_data(&self) -> Recv<T> {
        poll(&self.data)
    }

    /// Number of pushed items not yet taken.
    pub fn pending(&self) -> usize {
        self.data.len()
    }
}
