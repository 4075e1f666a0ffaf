//! # Node Graph
//!
//! Kademlia-style routing over the XOR metric.
//!
//! ## Metric
//!
//! - `distance(a, b)` is `a XOR b` read as a big-endian unsigned integer
//! - `bucket_index(self, other) = floor(log2(distance(self, other)))`, so
//!   bucket 255 holds the farthest half of the id space
//!
//! ## Buckets
//!
//! Each bucket holds up to `k` records in least-recently-seen order. When a
//! new node lands in a full bucket, the oldest entry is pinged: if it answers
//! it moves to the back and the newcomer is dropped, otherwise it is evicted
//! and the newcomer takes its place.
//!
//! ## Lookups
//!
//! [`NodeGraph::iterative_find`] seeds a [`NodeConnectionQueue`] with the
//! closest known records and asks each contacted node for its closest records
//! to the target, until the target itself turns up.

use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::connection_queue::{Attempt, Lane, NodeConnectionQueue};
use crate::error::PeerError;
use crate::identity::{Address, NodeId, PublicKey, distance_cmp};
use crate::peer_store::PeerInfo;
use crate::protocols::NodeGraphRpc;

/// Default bucket size.
pub const DEFAULT_K: usize = 20;

/// Default lookup concurrency per lane.
pub const DEFAULT_ALPHA: usize = 3;

const BUCKET_COUNT: usize = 256;

/// One routing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub address: Option<Address>,
}

impl NodeRecord {
    pub fn new(public_key: PublicKey, address: Option<Address>) -> Self {
        Self {
            node_id: public_key.node_id(),
            public_key,
            address,
        }
    }

    pub fn from_peer_info(info: &PeerInfo) -> Self {
        Self::new(info.public_key.clone(), info.peer_address.clone())
    }

    /// Whether the id was derived from the key it travels with.
    pub fn is_consistent(&self) -> bool {
        self.node_id == self.public_key.node_id()
    }
}

/// Contacts with an address are dialled directly; the rest need a relay.
fn lane_for(record: &NodeRecord) -> Lane {
    if record.address.is_some() {
        Lane::Direct
    } else {
        Lane::Signal
    }
}

// ============================================================================
// Routing table
// ============================================================================

#[derive(Debug, Clone, Default)]
struct RoutingBucket {
    records: Vec<NodeRecord>,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full {
        new_record: Box<NodeRecord>,
        oldest: Box<NodeRecord>,
    },
}

#[derive(Clone, Debug)]
struct PendingBucketUpdate {
    bucket_index: usize,
    oldest: NodeRecord,
    new_record: NodeRecord,
}

impl RoutingBucket {
    fn touch(&mut self, record: NodeRecord, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.records.iter().position(|r| r.node_id == record.node_id) {
            self.records.remove(pos);
            self.records.push(record);
            return BucketTouchOutcome::Refreshed;
        }

        match self.records.first() {
            Some(oldest) if self.records.len() >= k => BucketTouchOutcome::Full {
                oldest: Box::new(oldest.clone()),
                new_record: Box::new(record),
            },
            _ => {
                self.records.push(record);
                BucketTouchOutcome::Inserted
            }
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.records.iter().position(|r| &r.node_id == id) {
            let existing = self.records.remove(pos);
            self.records.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<NodeRecord> {
        let pos = self.records.iter().position(|r| &r.node_id == id)?;
        Some(self.records.remove(pos))
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k: k.max(1),
            buckets: vec![RoutingBucket::default(); BUCKET_COUNT],
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Insert or refresh. Ignores our own id.
    pub fn update(&mut self, record: NodeRecord) {
        let _ = self.update_with_pending(record);
    }

    fn update_with_pending(&mut self, record: NodeRecord) -> Option<PendingBucketUpdate> {
        let idx = self.self_id.bucket_index(&record.node_id)?;
        match self.buckets[idx].touch(record, self.k) {
            BucketTouchOutcome::Inserted | BucketTouchOutcome::Refreshed => None,
            BucketTouchOutcome::Full { new_record, oldest } => Some(PendingBucketUpdate {
                bucket_index: idx,
                oldest: *oldest,
                new_record: *new_record,
            }),
        }
    }

    fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.node_id);
            return;
        }

        let _ = bucket.remove(&pending.oldest.node_id);
        let already_present = bucket
            .records
            .iter()
            .any(|r| r.node_id == pending.new_record.node_id);
        if !already_present && bucket.records.len() < self.k {
            bucket.records.push(pending.new_record);
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeRecord> {
        let idx = self.self_id.bucket_index(id)?;
        self.buckets[idx].records.iter().find(|r| &r.node_id == id).cloned()
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<NodeRecord> {
        let idx = self.self_id.bucket_index(id)?;
        self.buckets[idx].remove(id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `k` records sorted by ascending distance to `target`.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<NodeRecord> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct ByDistance {
            dist: [u8; 32],
            record: NodeRecord,
        }

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(k + 1);
        for record in self.buckets.iter().flat_map(|b| &b.records) {
            let dist = record.node_id.xor_distance(target);
            if heap.len() < k {
                heap.push(ByDistance { dist, record: record.clone() });
            } else if let Some(farthest) = heap.peek()
                && distance_cmp(&dist, &farthest.dist) == std::cmp::Ordering::Less
            {
                heap.push(ByDistance { dist, record: record.clone() });
                heap.pop();
            }
        }

        heap.into_sorted_vec().into_iter().map(|e| e.record).collect()
    }
}

// ============================================================================
// Node graph actor
// ============================================================================

enum Command {
    AddNode(NodeRecord),
    RemoveNode(NodeId, oneshot::Sender<Option<NodeRecord>>),
    GetNode(NodeId, oneshot::Sender<Option<NodeRecord>>),
    Closest(NodeId, usize, oneshot::Sender<Vec<NodeRecord>>),
    Size(oneshot::Sender<usize>),
    ApplyPingResult(PendingBucketUpdate, bool),
    Quit,
}

/// Handle to the routing table actor. Cheap to clone.
#[derive(Clone)]
pub struct NodeGraph {
    cmd_tx: mpsc::Sender<Command>,
    self_record: NodeRecord,
    rpc: Arc<dyn NodeGraphRpc>,
    k: usize,
    alpha: usize,
}

struct NodeGraphActor {
    routing: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::WeakSender<Command>,
    rpc: Arc<dyn NodeGraphRpc>,
}

impl NodeGraph {
    pub fn new(self_record: NodeRecord, rpc: Arc<dyn NodeGraphRpc>, k: usize, alpha: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let actor = NodeGraphActor {
            routing: RoutingTable::new(self_record.node_id, k),
            cmd_rx,
            cmd_tx: cmd_tx.downgrade(),
            rpc: rpc.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            self_record,
            rpc,
            k: k.max(1),
            alpha: alpha.max(1),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.self_record.node_id
    }

    pub fn self_record(&self) -> &NodeRecord {
        &self.self_record
    }

    pub async fn add_node(&self, record: NodeRecord) {
        let _ = self.cmd_tx.send(Command::AddNode(record)).await;
    }

    pub async fn remove_node(&self, id: &NodeId) -> Option<NodeRecord> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::RemoveNode(*id, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn get_node(&self, id: &NodeId) -> Option<NodeRecord> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetNode(*id, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn closest_nodes(&self, target: &NodeId, k: usize) -> Vec<NodeRecord> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Closest(*target, k, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Size(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Answer a remote closest-nodes query. The requester is left out of its
    /// own answer.
    pub async fn handle_closest_nodes_request(&self, from: &PublicKey, target: NodeId) -> Vec<NodeRecord> {
        let requester = from.node_id();
        let mut closest = self.closest_nodes(&target, self.k + 1).await;
        closest.retain(|r| r.node_id != requester);
        closest.truncate(self.k);
        closest
    }

    /// Locate `target` by asking progressively closer nodes. `Ok(None)` means
    /// the search ran out of candidates without finding it.
    pub async fn iterative_find(&self, target: NodeId, timeout: Duration) -> Result<Option<NodeRecord>> {
        if let Some(known) = self.get_node(&target).await {
            return Ok(Some(known));
        }

        let seeds = self.closest_nodes(&target, self.k).await;
        let mut queue = NodeConnectionQueue::new(target, self.alpha, self.alpha, self.k * self.alpha);
        for record in seeds {
            queue.queue(lane_for(&record), record.node_id, record);
        }

        let found: Arc<Mutex<Option<NodeRecord>>> = Arc::new(Mutex::new(None));
        let self_id = self.node_id();
        let attempt = |lane: Lane, node_id: NodeId, record: NodeRecord| {
            let rpc = self.rpc.clone();
            let graph = self.clone();
            let found = found.clone();
            async move {
                trace!(node = %node_id, lane = ?lane, "asking for closest nodes");
                let answer = rpc.closest_nodes(&record, target).await?;
                graph.add_node(record).await;

                let mut discovered = Vec::new();
                for candidate in answer {
                    if !candidate.is_consistent() || candidate.node_id == self_id {
                        continue;
                    }
                    if candidate.node_id == target {
                        graph.add_node(candidate.clone()).await;
                        *found.lock().unwrap_or_else(|p| p.into_inner()) = Some(candidate);
                        return Ok(Attempt::connected());
                    }
                    discovered.push((lane_for(&candidate), candidate.node_id, candidate));
                }
                Ok(Attempt::discovered(discovered))
            }
        };

        let outcome = tokio::time::timeout(timeout, queue.run(attempt))
            .await
            .map_err(|_| PeerError::timeout("node lookup", timeout))?;
        debug!(
            lookup = %target,
            contacted = outcome.contacted,
            found = outcome.connection_made,
            "iterative find finished"
        );

        let result = found.lock().unwrap_or_else(|p| p.into_inner()).take();
        Ok(result)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl NodeGraphActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::AddNode(record) => self.handle_add_node(record),
                Command::RemoveNode(id, reply) => {
                    let _ = reply.send(self.routing.remove(&id));
                }
                Command::GetNode(id, reply) => {
                    let _ = reply.send(self.routing.get(&id));
                }
                Command::Closest(target, k, reply) => {
                    let _ = reply.send(self.routing.closest(&target, k));
                }
                Command::Size(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::ApplyPingResult(pending, alive) => {
                    trace!(
                        oldest = %pending.oldest.node_id,
                        alive,
                        "applying bucket liveness result"
                    );
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::Quit => break,
            }
        }
    }

    fn handle_add_node(&mut self, record: NodeRecord) {
        if let Some(update) = self.routing.update_with_pending(record) {
            let rpc = self.rpc.clone();
            let Some(tx) = self.cmd_tx.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let alive = rpc.ping(&update.oldest).await.is_ok();
                let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
            });
        }
    }
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGraph")
            .field("node_id", &self.self_record.node_id)
            .field("k", &self.k)
            .field("alpha", &self.alpha)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::RwLock;

    use crate::identity::Keypair;

    fn id_with_prefix(first: u8, rest: u8) -> NodeId {
        let mut bytes = [rest; 32];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    fn record_with_id(node_id: NodeId) -> NodeRecord {
        NodeRecord {
            node_id,
            public_key: Keypair::generate().public_key(),
            address: Some(Address::new("127.0.0.1", 4000)),
        }
    }

    #[test]
    fn records_land_in_log2_buckets() {
        let table_id = NodeId::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(table_id, 4);
        let far = record_with_id(id_with_prefix(0x80, 0));
        let near = record_with_id(NodeId::from_bytes({
            let mut b = [0u8; 32];
            b[31] = 1;
            b
        }));
        table.update(far.clone());
        table.update(near.clone());
        table.update(record_with_id(table_id));

        assert_eq!(table.len(), 2);
        assert_eq!(table.buckets[255].records, vec![far]);
        assert_eq!(table.buckets[0].records, vec![near]);
    }

    #[test]
    fn lookup_lane_follows_address() {
        let mut record = record_with_id(id_with_prefix(0x10, 0));
        assert_eq!(lane_for(&record), Lane::Direct);
        record.address = None;
        assert_eq!(lane_for(&record), Lane::Signal);
    }

    #[test]
    fn closest_is_sorted_and_bounded() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 32]), 20);
        for first in [0x90u8, 0x10, 0x40, 0x01, 0x20] {
            table.update(record_with_id(id_with_prefix(first, 0)));
        }
        let target = NodeId::from_bytes([0u8; 32]);
        let closest: Vec<u8> = table
            .closest(&target, 3)
            .iter()
            .map(|r| r.node_id.as_bytes()[0])
            .collect();
        assert_eq!(closest, vec![0x01, 0x10, 0x20]);
        assert!(table.closest(&target, 0).is_empty());
    }

    #[test]
    fn full_bucket_keeps_live_oldest() {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 32]), 1);
        let oldest = record_with_id(id_with_prefix(0x80, 1));
        let newcomer = record_with_id(id_with_prefix(0x80, 2));
        table.update(oldest.clone());

        let pending = table.update_with_pending(newcomer.clone()).expect("bucket full");
        table.apply_ping_result(pending, true);
        assert!(table.get(&oldest.node_id).is_some());
        assert!(table.get(&newcomer.node_id).is_none());

        let pending = table.update_with_pending(newcomer.clone()).expect("bucket full");
        table.apply_ping_result(pending, false);
        assert!(table.get(&oldest.node_id).is_none());
        assert_eq!(table.get(&newcomer.node_id), Some(newcomer));
    }

    // ------------------------------------------------------------------------
    // In-memory network of node graphs
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Registry {
        graphs: RwLock<HashMap<NodeId, NodeGraph>>,
    }

    struct TestNetwork {
        registry: Arc<Registry>,
        me: PublicKey,
        dead: HashSet<NodeId>,
        delay: Option<Duration>,
    }

    #[async_trait::async_trait]
    impl NodeGraphRpc for TestNetwork {
        async fn closest_nodes(&self, to: &NodeRecord, target: NodeId) -> Result<Vec<NodeRecord>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let graph = self
                .registry
                .graphs
                .read()
                .await
                .get(&to.node_id)
                .cloned()
                .ok_or_else(|| anyhow!("node unreachable"))?;
            Ok(graph.handle_closest_nodes_request(&self.me, target).await)
        }

        async fn ping(&self, to: &NodeRecord) -> Result<()> {
            if self.dead.contains(&to.node_id) {
                Err(anyhow!("no answer"))
            } else {
                Ok(())
            }
        }
    }

    async fn spawn_graph(registry: &Arc<Registry>, dead: HashSet<NodeId>, delay: Option<Duration>) -> NodeGraph {
        let key = Keypair::generate().public_key();
        let record = NodeRecord::new(key.clone(), Some(Address::new("127.0.0.1", 5000)));
        let network = TestNetwork {
            registry: registry.clone(),
            me: key,
            dead,
            delay,
        };
        let graph = NodeGraph::new(record.clone(), Arc::new(network), DEFAULT_K, DEFAULT_ALPHA);
        registry.graphs.write().await.insert(record.node_id, graph.clone());
        graph
    }

    #[tokio::test]
    async fn add_get_remove_round_trip() {
        let registry = Arc::new(Registry::default());
        let graph = spawn_graph(&registry, HashSet::new(), None).await;
        let other = NodeRecord::new(Keypair::generate().public_key(), None);

        graph.add_node(other.clone()).await;
        graph.add_node(graph.self_record().clone()).await;
        assert_eq!(graph.get_node(&other.node_id).await, Some(other.clone()));
        assert_eq!(graph.size().await, 1);
        assert_eq!(graph.remove_node(&other.node_id).await, Some(other.clone()));
        assert_eq!(graph.get_node(&other.node_id).await, None);
    }

    #[tokio::test]
    async fn requester_is_left_out_of_closest_answer() {
        let registry = Arc::new(Registry::default());
        let graph = spawn_graph(&registry, HashSet::new(), None).await;
        let asker = NodeRecord::new(Keypair::generate().public_key(), None);
        let other = NodeRecord::new(Keypair::generate().public_key(), None);
        graph.add_node(asker.clone()).await;
        graph.add_node(other.clone()).await;

        let answer = graph
            .handle_closest_nodes_request(&asker.public_key, asker.node_id)
            .await;
        assert_eq!(answer, vec![other]);
    }

    #[tokio::test]
    async fn iterative_find_walks_the_chain() {
        let registry = Arc::new(Registry::default());
        let a = spawn_graph(&registry, HashSet::new(), None).await;
        let b = spawn_graph(&registry, HashSet::new(), None).await;
        let c = spawn_graph(&registry, HashSet::new(), None).await;
        let d = spawn_graph(&registry, HashSet::new(), None).await;
        a.add_node(b.self_record().clone()).await;
        b.add_node(c.self_record().clone()).await;
        c.add_node(d.self_record().clone()).await;

        let found = a
            .iterative_find(d.node_id(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found.as_ref(), Some(d.self_record()));
        assert!(a.get_node(&d.node_id()).await.is_some());
        assert!(a.get_node(&c.node_id()).await.is_some());
    }

    #[tokio::test]
    async fn iterative_find_reports_exhaustion() {
        let registry = Arc::new(Registry::default());
        let a = spawn_graph(&registry, HashSet::new(), None).await;
        let b = spawn_graph(&registry, HashSet::new(), None).await;
        a.add_node(b.self_record().clone()).await;

        let missing = NodeId::random();
        let found = a.iterative_find(missing, Duration::from_secs(5)).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn iterative_find_times_out() {
        let registry = Arc::new(Registry::default());
        let a = spawn_graph(&registry, HashSet::new(), Some(Duration::from_secs(30))).await;
        let b = spawn_graph(&registry, HashSet::new(), None).await;
        a.add_node(b.self_record().clone()).await;

        let err = a
            .iterative_find(NodeId::random(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(PeerError::is_timeout(&err));
    }

    #[tokio::test]
    async fn dead_oldest_is_evicted_through_actor() {
        let oldest = record_with_id(id_with_prefix(0x80, 1));
        let newcomer = record_with_id(id_with_prefix(0x80, 2));
        let registry = Arc::new(Registry::default());
        let network = TestNetwork {
            registry,
            me: Keypair::generate().public_key(),
            dead: HashSet::from([oldest.node_id]),
            delay: None,
        };
        let mut self_record = record_with_id(NodeId::from_bytes([0u8; 32]));
        self_record.address = None;
        let graph = NodeGraph::new(self_record, Arc::new(network), 1, 1);

        graph.add_node(oldest.clone()).await;
        graph.add_node(newcomer.clone()).await;

        let replaced = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if graph.get_node(&newcomer.node_id).await.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(replaced.is_ok());
        assert!(graph.get_node(&oldest.node_id).await.is_none());
    }
}
