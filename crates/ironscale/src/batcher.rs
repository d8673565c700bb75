//! the batcher: per-node session fan-out.
//!
//! owns every active map stream. each node has a connection set holding
//! one or more channels; changes enter through [`Batcher::add_work`], are
//! dispatched immediately or coalesced per tick, turned into map
//! responses by the worker pool, and broadcast to the node's channels.
//!
//! online/offline transitions run through a dedicated fifo lane with a
//! monotonic sequence, so any two such events are observed in the same
//! order by every node.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use ironscale_proto::{CapabilityVersion, MapResponse};
use ironscale_types::{Change, ChangeSet, NodeId, TuningConfig};

use crate::mapper::{Mapper, MapperError};

/// errors surfaced by the batcher's public contract.
#[derive(Debug, Error)]
pub enum BatcherError {
    /// the initial map could not be written within its deadline.
    #[error("initial map send to node {0} timed out")]
    InitialMapTimeout(NodeId),

    /// the batcher is shutting down.
    #[error("batcher is shutting down")]
    ShuttingDown,

    /// map generation failed.
    #[error(transparent)]
    Mapper(#[from] MapperError),
}

/// a work item for the worker pool.
struct Work {
    c: ChangeSet,
    node_id: NodeId,
    /// present for synchronous map generation; the worker answers here
    /// instead of broadcasting.
    result_tx: Option<oneshot::Sender<Result<Option<MapResponse>, MapperError>>>,
}

/// an online/offline change with its frozen target list and sequence.
struct OrderedWork {
    c: ChangeSet,
    targets: Vec<NodeId>,
    seq: u64,
}

/// a single channel registered for a node.
struct ConnectionEntry {
    id: u64,
    tx: mpsc::Sender<MapResponse>,
    version: CapabilityVersion,
    #[allow(dead_code)]
    created: Instant,
    last_used: Mutex<Instant>,
}

impl ConnectionEntry {
    /// send with the bounded per-channel timeout. a timeout marks the
    /// channel stale; the caller removes it.
    async fn send(&self, resp: MapResponse, timeout: Duration) -> bool {
        match self.tx.send_timeout(resp, timeout).await {
            Ok(()) => {
                *self.last_used.lock().await = Instant::now();
                true
            }
            Err(_) => false,
        }
    }
}

/// all channels of one node.
struct NodeConn {
    id: NodeId,
    connections: Mutex<Vec<Arc<ConnectionEntry>>>,
}

impl NodeConn {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            connections: Mutex::new(Vec::new()),
        }
    }

    async fn add_connection(&self, entry: Arc<ConnectionEntry>) {
        self.connections.lock().await.push(entry);
    }

    /// remove the channel backed by the same sender. true when found.
    async fn remove_connection(&self, tx: &mpsc::Sender<MapResponse>) -> bool {
        let mut conns = self.connections.lock().await;
        let before = conns.len();
        conns.retain(|c| !c.tx.same_channel(tx));
        conns.len() != before
    }

    async fn active_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// the capability version of the first live channel.
    async fn version(&self) -> Option<CapabilityVersion> {
        self.connections.lock().await.first().map(|c| c.version)
    }

    /// broadcast to every channel, pruning the ones that time out.
    /// returns the number of channels left afterwards.
    async fn broadcast(&self, resp: &MapResponse, timeout: Duration) -> usize {
        let mut conns = self.connections.lock().await;
        let mut healthy = Vec::with_capacity(conns.len());

        for conn in conns.drain(..) {
            if conn.send(resp.clone(), timeout).await {
                healthy.push(conn);
            } else {
                warn!(
                    node_id = %self.id,
                    conn_id = conn.id,
                    "channel send timed out, removing stale connection"
                );
            }
        }

        *conns = healthy;
        conns.len()
    }

    /// drop connections idle past the threshold. returns (removed, left).
    async fn prune_stale(&self, threshold: Duration) -> (usize, usize) {
        let mut conns = self.connections.lock().await;
        let before = conns.len();
        let now = Instant::now();

        let mut healthy = Vec::with_capacity(conns.len());
        for conn in conns.drain(..) {
            let idle = now.duration_since(*conn.last_used.lock().await);
            if idle > threshold {
                debug!(
                    node_id = %self.id,
                    conn_id = conn.id,
                    idle_secs = idle.as_secs(),
                    "removing stale connection"
                );
            } else {
                healthy.push(conn);
            }
        }

        let removed = before - healthy.len();
        *conns = healthy;
        (removed, conns.len())
    }
}

struct BatcherInner {
    mapper: Mapper,
    tuning: TuningConfig,

    /// node id -> connection set. sets outlive their last channel so a
    /// rapid reconnect reuses them.
    nodes: DashMap<NodeId, Arc<NodeConn>>,

    /// node id -> disconnect timestamp. `None` means connected.
    connected: DashMap<NodeId, Option<Instant>>,

    work_tx: mpsc::Sender<Work>,
    ordered_tx: mpsc::Sender<OrderedWork>,
    seq: AtomicU64,
    conn_ids: AtomicU64,

    /// batched (non-immediate) changes awaiting the next tick.
    pending: std::sync::Mutex<HashMap<NodeId, Vec<ChangeSet>>>,

    cancel: CancellationToken,
}

/// handle to the running batcher. cheap to clone.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<BatcherInner>,
}

impl Batcher {
    /// start the batcher: worker pool, ordered lane, and reapers.
    pub fn start(mapper: Mapper, tuning: TuningConfig) -> Self {
        let (work_tx, work_rx) = mpsc::channel(tuning.work_queue_depth);
        let (ordered_tx, ordered_rx) = mpsc::channel(tuning.work_queue_depth);
        let cancel = CancellationToken::new();

        let inner = Arc::new(BatcherInner {
            mapper,
            tuning: tuning.clone(),
            nodes: DashMap::new(),
            connected: DashMap::new(),
            work_tx,
            ordered_tx,
            seq: AtomicU64::new(0),
            conn_ids: AtomicU64::new(0),
            pending: std::sync::Mutex::new(HashMap::new()),
            cancel,
        });

        let work_rx = Arc::new(Mutex::new(work_rx));
        for worker_id in 0..tuning.batcher_workers.max(1) {
            tokio::spawn(worker_loop(inner.clone(), work_rx.clone(), worker_id));
        }
        tokio::spawn(ordered_loop(inner.clone(), ordered_rx));
        tokio::spawn(ticker_loop(inner.clone()));

        Self { inner }
    }

    /// stop all workers and tickers; senders observe cancellation before
    /// touching channels, so no writes race the shutdown.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// register a new channel for a node and synchronously deliver the
    /// initial full map. on deadline the channel is removed again.
    pub async fn add_node(
        &self,
        id: NodeId,
        tx: mpsc::Sender<MapResponse>,
        version: CapabilityVersion,
    ) -> Result<(), BatcherError> {
        let entry = Arc::new(ConnectionEntry {
            id: self.inner.conn_ids.fetch_add(1, Ordering::Relaxed),
            tx: tx.clone(),
            version,
            created: Instant::now(),
            last_used: Mutex::new(Instant::now()),
        });

        let conn = self
            .inner
            .nodes
            .entry(id)
            .or_insert_with(|| Arc::new(NodeConn::new(id)))
            .clone();
        conn.add_connection(entry).await;
        let connections = conn.active_connections().await;
        trace!(node_id = %id, connections, "connection added");

        // initial full-self map through the worker pool, bounded write
        let initial = self
            .map_response_from_change(id, ChangeSet::full_self(id))
            .await?;

        if let Some(resp) = initial {
            let deadline = Duration::from_secs(self.inner.tuning.initial_map_timeout_secs);
            if tx.send_timeout(resp, deadline).await.is_err() {
                conn.remove_connection(&tx).await;
                return Err(BatcherError::InitialMapTimeout(id));
            }
        }

        self.inner.connected.insert(id, None);
        Ok(())
    }

    /// remove the channel backed by `tx`. when the set drains, the
    /// disconnect timestamp starts the grace window; the set itself stays
    /// for rapid reconnection.
    pub async fn remove_node(&self, id: NodeId, tx: &mpsc::Sender<MapResponse>) -> bool {
        let Some(conn) = self.inner.nodes.get(&id).map(|e| e.clone()) else {
            return false;
        };

        if !conn.remove_connection(tx).await {
            return false;
        }

        if conn.active_connections().await == 0 {
            self.inner.connected.insert(id, Some(Instant::now()));
            debug!(node_id = %id, "last connection removed, grace window started");
        }
        true
    }

    /// enqueue a change for distribution.
    pub async fn add_work(&self, c: ChangeSet) {
        trace!(change = %c.change, node_id = %c.node_id, "add_work");

        if is_immediate(&c) {
            if c.self_update_only {
                self.queue_work(Work {
                    c,
                    node_id: c.node_id,
                    result_tx: None,
                })
                .await;
                return;
            }

            if matches!(c.change, Change::NodeCameOnline | Change::NodeWentOffline) {
                self.add_ordered_work(c).await;
                return;
            }

            for target in self.targets_for(&c) {
                self.queue_work(Work {
                    c,
                    node_id: target,
                    result_tx: None,
                })
                .await;
            }
            return;
        }

        // batched: coalesce until the next tick
        let mut pending = self.inner.pending.lock().expect("pending mutex poisoned");
        if c.self_update_only {
            pending.entry(c.node_id).or_default().push(c);
        } else {
            for target in self.targets_for(&c) {
                pending.entry(target).or_default().push(c);
            }
        }
    }

    /// synchronous map generation through the worker pool.
    pub async fn map_response_from_change(
        &self,
        id: NodeId,
        c: ChangeSet,
    ) -> Result<Option<MapResponse>, BatcherError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.queue_work(Work {
            c,
            node_id: id,
            result_tx: Some(result_tx),
        })
        .await;

        tokio::select! {
            result = result_rx => match result {
                Ok(r) => Ok(r?),
                Err(_) => Err(BatcherError::ShuttingDown),
            },
            _ = self.inner.cancel.cancelled() => Err(BatcherError::ShuttingDown),
        }
    }

    /// whether a node counts as connected: a live channel, or a
    /// disconnect within the grace window.
    pub fn is_connected(&self, id: NodeId) -> bool {
        if let Some(conn) = self.inner.nodes.get(&id)
            && let Ok(conns) = conn.connections.try_lock()
            && !conns.is_empty()
        {
            return true;
        }

        match self.inner.connected.get(&id).map(|e| *e.value()) {
            // no record: never connected
            None => false,
            // nil timestamp: connected
            Some(None) => true,
            Some(Some(disconnected_at)) => {
                let grace = Duration::from_secs(self.inner.tuning.disconnect_grace_secs);
                disconnected_at.elapsed() < grace
            }
        }
    }

    /// snapshot of connection state for every known node (grace included).
    pub fn connected_map(&self) -> HashMap<NodeId, bool> {
        let mut map = HashMap::new();
        for entry in self.inner.connected.iter() {
            map.insert(*entry.key(), self.is_connected(*entry.key()));
        }
        map
    }

    /// connection state by live channels only, ignoring the grace window.
    /// route failover wants the hard truth.
    pub fn live_connected_map(&self) -> HashMap<NodeId, bool> {
        let mut map = HashMap::new();
        for entry in self.inner.nodes.iter() {
            let live = entry
                .value()
                .connections
                .try_lock()
                .map(|c| !c.is_empty())
                .unwrap_or(true);
            map.insert(*entry.key(), live);
        }
        map
    }

    /// every node that should receive `c`.
    fn targets_for(&self, c: &ChangeSet) -> Vec<NodeId> {
        self.inner
            .nodes
            .iter()
            .map(|e| *e.key())
            .filter(|id| *id != c.node_id || c.also_self())
            .collect()
    }

    async fn add_ordered_work(&self, c: ChangeSet) {
        let targets = self.targets_for(&c);
        if targets.is_empty() {
            return;
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let work = OrderedWork { c, targets, seq };

        tokio::select! {
            result = self.inner.ordered_tx.send(work) => {
                if result.is_err() {
                    debug!(change = %c.change, "ordered lane closed, dropping change");
                }
            }
            _ = self.inner.cancel.cancelled() => {}
        }
    }

    async fn queue_work(&self, w: Work) {
        tokio::select! {
            result = self.inner.work_tx.send(w) => {
                if result.is_err() {
                    debug!("work queue closed, dropping work");
                }
            }
            _ = self.inner.cancel.cancelled() => {}
        }
    }
}

/// changes that bypass batching.
fn is_immediate(c: &ChangeSet) -> bool {
    matches!(
        c.change,
        Change::Full
            | Change::NodeRemove
            | Change::NodeCameOnline
            | Change::NodeWentOffline
            | Change::Policy
    )
}

/// single consumer of the ordered lane.
///
/// every target of item N is fully served before item N+1 is looked at.
/// dispatch happens here rather than through the worker pool: two pool
/// workers holding consecutive transitions for the same target could
/// otherwise complete out of order. presence patches carry no state
/// lookups, so the sequential path stays cheap.
async fn ordered_loop(inner: Arc<BatcherInner>, mut rx: mpsc::Receiver<OrderedWork>) {
    debug!("ordered online/offline lane started");
    loop {
        let work = tokio::select! {
            w = rx.recv() => match w {
                Some(w) => w,
                None => break,
            },
            _ = inner.cancel.cancelled() => break,
        };

        trace!(
            change = %work.c.change,
            seq = work.seq,
            targets = work.targets.len(),
            "dispatching ordered change"
        );

        let online = connected_snapshot(&inner);
        let timeout = Duration::from_millis(inner.tuning.send_timeout_ms);

        for target in work.targets {
            if inner.cancel.is_cancelled() {
                return;
            }
            let Some(conn) = inner.nodes.get(&target).map(|e| e.clone()) else {
                continue;
            };
            let Some(version) = conn.version().await else {
                continue;
            };

            match inner.mapper.generate(target, &work.c, version, &online).await {
                Ok(Some(resp)) => {
                    let left = conn.broadcast(&resp, timeout).await;
                    if left == 0 {
                        inner.connected.insert(target, Some(Instant::now()));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        target = %target,
                        change = %work.c.change,
                        seq = work.seq,
                        error = %e,
                        "failed to apply ordered change"
                    );
                }
            }
        }
    }
    debug!("ordered online/offline lane stopped");
}

/// one worker of the pool. workers share the receiver behind a mutex;
/// whoever holds it takes the next item and releases before processing.
async fn worker_loop(
    inner: Arc<BatcherInner>,
    work_rx: Arc<Mutex<mpsc::Receiver<Work>>>,
    worker_id: usize,
) {
    debug!(worker_id, "batcher worker started");
    loop {
        let work = {
            let mut rx = tokio::select! {
                guard = work_rx.lock() => guard,
                _ = inner.cancel.cancelled() => break,
            };
            tokio::select! {
                w = rx.recv() => match w {
                    Some(w) => w,
                    None => break,
                },
                _ = inner.cancel.cancelled() => break,
            }
        };

        process_work(&inner, work, worker_id).await;
    }
    debug!(worker_id, "batcher worker stopped");
}

async fn process_work(inner: &Arc<BatcherInner>, work: Work, worker_id: usize) {
    // synchronous request: generate and answer the caller
    if let Some(result_tx) = work.result_tx {
        let version = match inner.nodes.get(&work.node_id).map(|e| e.clone()) {
            Some(conn) => conn.version().await.unwrap_or_default(),
            None => CapabilityVersion::default(),
        };
        let online = connected_snapshot(inner);
        let result = inner
            .mapper
            .generate(work.node_id, &work.c, version, &online)
            .await;

        if let Err(ref e) = result {
            error!(worker_id, node_id = %work.node_id, error = %e, "synchronous map generation failed");
        }
        let _ = result_tx.send(result);
        return;
    }

    // asynchronous: generate and broadcast to the target's channels
    let Some(conn) = inner.nodes.get(&work.node_id).map(|e| e.clone()) else {
        return;
    };
    let Some(version) = conn.version().await else {
        // no live channels; the change will be covered by the full map on
        // reconnect
        return;
    };

    let online = connected_snapshot(inner);
    match inner
        .mapper
        .generate(work.node_id, &work.c, version, &online)
        .await
    {
        Ok(Some(resp)) => {
            let timeout = Duration::from_millis(inner.tuning.send_timeout_ms);
            let left = conn.broadcast(&resp, timeout).await;
            if left == 0 {
                inner.connected.insert(work.node_id, Some(Instant::now()));
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(worker_id, node_id = %work.node_id, change = %work.c.change, error = %e, "failed to apply change");
        }
    }
}

fn connected_snapshot(inner: &Arc<BatcherInner>) -> HashMap<NodeId, bool> {
    let grace = Duration::from_secs(inner.tuning.disconnect_grace_secs);
    let mut map = HashMap::new();
    for entry in inner.connected.iter() {
        let connected = match entry.value() {
            None => true,
            Some(t) => t.elapsed() < grace,
        };
        map.insert(*entry.key(), connected);
    }
    map
}

/// batch flush, keep-alives, and the two reapers.
async fn ticker_loop(inner: Arc<BatcherInner>) {
    let mut batch_tick = tokio::time::interval(Duration::from_millis(inner.tuning.batch_tick_ms));
    let mut stale_tick = tokio::time::interval(Duration::from_secs(
        inner.tuning.stale_reaper_interval_secs,
    ));
    let mut cleanup_tick = tokio::time::interval(Duration::from_secs(
        inner.tuning.offline_cleanup_interval_secs,
    ));
    // keep-alives go through the channels and stamp last_used, so a
    // healthy idle connection never trips the stale reaper
    let keepalive_secs = inner.tuning.map_keepalive_interval_secs;
    let mut keepalive_tick =
        tokio::time::interval(Duration::from_secs(if keepalive_secs > 0 {
            keepalive_secs
        } else {
            // disabled: tick far beyond any session lifetime
            86_400 * 365
        }));

    loop {
        tokio::select! {
            _ = batch_tick.tick() => flush_batched(&inner).await,
            _ = stale_tick.tick() => reap_stale_connections(&inner).await,
            _ = cleanup_tick.tick() => cleanup_offline_nodes(&inner),
            _ = keepalive_tick.tick(), if keepalive_secs > 0 => send_keepalives(&inner).await,
            _ = inner.cancel.cancelled() => break,
        }
    }
}

/// broadcast a keep-alive on every live channel.
async fn send_keepalives(inner: &Arc<BatcherInner>) {
    let timeout = Duration::from_millis(inner.tuning.send_timeout_ms);
    let conns: Vec<Arc<NodeConn>> = inner.nodes.iter().map(|e| e.value().clone()).collect();

    for conn in conns {
        if conn.active_connections().await == 0 {
            continue;
        }
        let left = conn.broadcast(&MapResponse::keepalive(), timeout).await;
        if left == 0 {
            inner.connected.insert(conn.id, Some(Instant::now()));
        }
    }
}

/// drain pending batched changes into the work queue.
async fn flush_batched(inner: &Arc<BatcherInner>) {
    let drained: Vec<(NodeId, Vec<ChangeSet>)> = {
        let mut pending = inner.pending.lock().expect("pending mutex poisoned");
        pending.drain().collect()
    };

    for (node_id, changes) in drained {
        for c in changes {
            let item = Work {
                c,
                node_id,
                result_tx: None,
            };
            tokio::select! {
                result = inner.work_tx.send(item) => {
                    if result.is_err() {
                        return;
                    }
                }
                _ = inner.cancel.cancelled() => return,
            }
        }
    }
}

/// remove connections whose last successful send is too old. clients
/// that vanished without closing the stream end up here.
async fn reap_stale_connections(inner: &Arc<BatcherInner>) {
    let threshold = Duration::from_secs(inner.tuning.stale_connection_secs);
    let mut total_removed = 0;

    let conns: Vec<Arc<NodeConn>> = inner.nodes.iter().map(|e| e.value().clone()).collect();
    for conn in conns {
        let (removed, left) = conn.prune_stale(threshold).await;
        total_removed += removed;
        if removed > 0 && left == 0 {
            inner.connected.insert(conn.id, Some(Instant::now()));
        }
    }

    if total_removed > 0 {
        debug!(removed = total_removed, "reaped stale connections");
    }
}

/// drop connection sets for nodes offline past the long threshold.
fn cleanup_offline_nodes(inner: &Arc<BatcherInner>) {
    let threshold = Duration::from_secs(inner.tuning.offline_cleanup_secs);

    let expired: Vec<NodeId> = inner
        .connected
        .iter()
        .filter_map(|entry| match entry.value() {
            Some(disconnected_at) if disconnected_at.elapsed() > threshold => Some(*entry.key()),
            _ => None,
        })
        .collect();

    for id in expired {
        let still_idle = inner
            .nodes
            .get(&id)
            .map(|conn| {
                conn.connections
                    .try_lock()
                    .map(|c| c.is_empty())
                    .unwrap_or(false)
            })
            .unwrap_or(true);

        if still_idle {
            inner.nodes.remove(&id);
            inner.connected.remove(&id);
            debug!(node_id = %id, "dropped long-offline connection set");
        }
    }
}
