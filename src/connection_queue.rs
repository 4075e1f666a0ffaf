//! # Node Connection Queue
//!
//! Bounded parallel contact search used by node graph lookups.
//!
//! Candidates sit in two queues, both sorted by ascending XOR distance to the
//! lookup target:
//!
//! | Lane | Holds | Concurrency |
//! |------|-------|-------------|
//! | [`Lane::Direct`] | nodes with a known address | own semaphore |
//! | [`Lane::Signal`] | nodes without an address, contacted through a relay | own semaphore, queue capped at [`SIGNAL_QUEUE_LIMIT`] |
//!
//! Contacts learned during the run come back tagged with their lane.
//!
//! [`NodeConnectionQueue::run`] keeps both lanes busy up to their permits and
//! stops issuing attempts once a connection is made, the contact limit is
//! reached, or both queues are empty with nothing in flight. A
//! [`CancelHandle`] ends the run early; attempts still in flight are aborted
//! rather than awaited.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::identity::{NodeId, distance_cmp};

/// Signal lane keeps only this many closest candidates.
pub const SIGNAL_QUEUE_LIMIT: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    Signal,
    Direct,
}

/// Result of contacting one candidate.
#[derive(Debug)]
pub struct Attempt<T> {
    /// The sought connection was established; the search is over.
    pub connected: bool,
    /// Further candidates learned from this contact, with the lane each
    /// should be tried on.
    pub discovered: Vec<(Lane, NodeId, T)>,
}

impl<T> Attempt<T> {
    pub fn connected() -> Self {
        Self {
            connected: true,
            discovered: Vec::new(),
        }
    }

    pub fn discovered(discovered: Vec<(Lane, NodeId, T)>) -> Self {
        Self {
            connected: false,
            discovered,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOutcome {
    pub connection_made: bool,
    pub contacted: usize,
    pub cancelled: bool,
}

/// Ends a running queue from outside.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

pub struct NodeConnectionQueue<T> {
    target: NodeId,
    signal: Vec<(NodeId, T)>,
    direct: Vec<(NodeId, T)>,
    seen: HashSet<NodeId>,
    signal_permits: Arc<Semaphore>,
    direct_permits: Arc<Semaphore>,
    contact_limit: usize,
    contacted: usize,
    connection_made: bool,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<T: Send + 'static> NodeConnectionQueue<T> {
    pub fn new(
        target: NodeId,
        signal_concurrency: usize,
        direct_concurrency: usize,
        contact_limit: usize,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            target,
            signal: Vec::new(),
            direct: Vec::new(),
            seen: HashSet::new(),
            signal_permits: Arc::new(Semaphore::new(signal_concurrency.max(1))),
            direct_permits: Arc::new(Semaphore::new(direct_concurrency.max(1))),
            contact_limit,
            contacted: 0,
            connection_made: false,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel_tx.clone(),
        }
    }

    pub fn signal_len(&self) -> usize {
        self.signal.len()
    }

    pub fn direct_len(&self) -> usize {
        self.direct.len()
    }

    /// Queue a node to be contacted through a relay. Returns `false` when the
    /// node was already seen or did not make the closest [`SIGNAL_QUEUE_LIMIT`].
    pub fn queue_signal(&mut self, node_id: NodeId, value: T) -> bool {
        if !self.seen.insert(node_id) {
            return false;
        }
        let position = insert_sorted(&mut self.signal, &self.target, node_id, value);
        if self.signal.len() > SIGNAL_QUEUE_LIMIT {
            self.signal.truncate(SIGNAL_QUEUE_LIMIT);
            return position < SIGNAL_QUEUE_LIMIT;
        }
        true
    }

    /// Queue a node with a known address.
    pub fn queue_direct(&mut self, node_id: NodeId, value: T) -> bool {
        if !self.seen.insert(node_id) {
            return false;
        }
        insert_sorted(&mut self.direct, &self.target, node_id, value);
        true
    }

    pub fn queue(&mut self, lane: Lane, node_id: NodeId, value: T) -> bool {
        match lane {
            Lane::Signal => self.queue_signal(node_id, value),
            Lane::Direct => self.queue_direct(node_id, value),
        }
    }

    /// Drive attempts until a termination condition holds.
    pub async fn run<F, Fut>(&mut self, mut attempt: F) -> QueueOutcome
    where
        F: FnMut(Lane, NodeId, T) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>> + Send + 'static,
    {
        let mut in_flight: JoinSet<Result<Attempt<T>>> = JoinSet::new();
        let mut cancel = self.cancel_rx.clone();

        loop {
            if self.connection_made || *cancel.borrow() {
                break;
            }
            self.launch(&mut in_flight, &mut attempt);
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => match joined {
                    Some(Ok(Ok(result))) => {
                        if result.connected {
                            self.connection_made = true;
                        }
                        for (lane, node_id, value) in result.discovered {
                            self.queue(lane, node_id, value);
                        }
                    }
                    Some(Ok(Err(e))) => trace!(error = %e, "contact attempt failed"),
                    Some(Err(e)) => trace!(error = %e, "contact attempt aborted"),
                    None => {}
                },
                Ok(()) = cancel.changed() => {}
            }
        }

        in_flight.abort_all();
        let outcome = QueueOutcome {
            connection_made: self.connection_made,
            contacted: self.contacted,
            cancelled: *cancel.borrow(),
        };
        debug!(
            lookup = %self.target,
            contacted = outcome.contacted,
            connected = outcome.connection_made,
            cancelled = outcome.cancelled,
            "connection queue finished"
        );
        outcome
    }

    fn launch<F, Fut>(&mut self, in_flight: &mut JoinSet<Result<Attempt<T>>>, attempt: &mut F)
    where
        F: FnMut(Lane, NodeId, T) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>> + Send + 'static,
    {
        while self.contacted < self.contact_limit {
            let next = if !self.direct.is_empty()
                && let Ok(permit) = self.direct_permits.clone().try_acquire_owned()
            {
                let (node_id, value) = self.direct.remove(0);
                Some((Lane::Direct, node_id, value, permit))
            } else if !self.signal.is_empty()
                && let Ok(permit) = self.signal_permits.clone().try_acquire_owned()
            {
                let (node_id, value) = self.signal.remove(0);
                Some((Lane::Signal, node_id, value, permit))
            } else {
                None
            };

            let Some((lane, node_id, value, permit)) = next else {
                break;
            };
            self.contacted += 1;
            trace!(node = %node_id, lane = ?lane, "contacting node");
            let fut = attempt(lane, node_id, value);
            in_flight.spawn(async move {
                let result = fut.await;
                drop(permit);
                result
            });
        }
    }
}

fn insert_sorted<T>(queue: &mut Vec<(NodeId, T)>, target: &NodeId, node_id: NodeId, value: T) -> usize {
    let distance = node_id.xor_distance(target);
    let position = queue
        .partition_point(|(id, _)| distance_cmp(&id.xor_distance(target), &distance).is_le());
    queue.insert(position, (node_id, value));
    position
}
