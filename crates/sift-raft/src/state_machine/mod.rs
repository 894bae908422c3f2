//! The replication state machine.
//!
//! [`ReplicationState`] binds the consensus node to the local store: it
//! serializes mutating requests into the log (`write`), replays committed
//! entries through the write executor in log order, drives snapshots, and
//! refreshes cluster membership. One instance exists per process.

pub(crate) mod core;
mod executor;
pub(crate) mod pending;

pub use executor::{
    error_response, ApplyJob, RouteHandler, RouteParams, Teardown, WriteContext, WriteExecutor,
    WriteRoute, WriteRouter,
};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{Config, Membership, Raft, SnapshotPolicy};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use sift_commons::cluster::{effective_nodes_config, parse_nodes};
use sift_commons::constants::{
    CONSENSUS_GROUP, DB_SNAPSHOT_NAME, LOG_DIR_NAME, META_DIR_NAME, SNAPSHOT_DIR_NAME,
};
use sift_store::{CollectionManager, Store};

use crate::codec::{encode_request, ReplicatedRequest, StoredResponse};
use crate::error::{ReplicationError, Result};
use crate::network::SiftNetworkFactory;
use crate::snapshot::SnapshotRepository;
use crate::state_machine::core::{RaftInstance, ReplicationCore};
use crate::state_machine::pending::{PendingWrite, PendingWrites};
use crate::storage::{SiftNode, SiftRaftStorage, StorageAdaptor};

/// Startup parameters of the replication layer.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub peering_host: String,
    pub peering_port: u16,
    pub api_port: u16,
    pub election_timeout_ms: u64,
    pub snapshot_interval_s: u64,
    pub apply_timeout_ms: u64,
    pub raft_dir: PathBuf,
    /// Comma-separated `ip:peering_port:api_port` triples; empty derives a
    /// singleton from the local identity.
    pub nodes: String,
    /// Snapshot a pre-existing stand-alone store after leader election
    /// instead of wiping it.
    pub create_init_db_snapshot: bool,
}

/// A point-in-time view of the replication layer, for `/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplicationStatus {
    /// Raw consensus state code (0 = node absent).
    pub state: u64,
    pub leader_id: Option<u64>,
    pub current_term: u64,
    pub committed_index: u64,
    pub queued_writes: usize,
    pub init_readiness_count: u64,
    pub reset_peers_count: u64,
}

/// The replicated write path of one siftd node.
pub struct ReplicationState {
    core: Arc<ReplicationCore>,
    storage: Arc<SiftRaftStorage>,
    network: SiftNetworkFactory,
    options: ReplicationOptions,
    node_id: u64,
}

impl ReplicationState {
    /// Wire up the state machine. The consensus node itself is created by
    /// [`start`](Self::start).
    pub fn new(
        store: Arc<Store>,
        collections: Arc<CollectionManager>,
        router: Arc<WriteRouter>,
        options: ReplicationOptions,
        shutting_down: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::channel(64);

        let core = Arc::new(ReplicationCore {
            store: store.clone(),
            collections: collections.clone(),
            pending: PendingWrites::default(),
            jobs_tx,
            node: RwLock::new(None),
            snapshots: SnapshotRepository::new(options.raft_dir.join(SNAPSHOT_DIR_NAME)),
            leader_term: AtomicU64::new(0),
            init_readiness_count: AtomicU64::new(0),
            reset_peers_count: AtomicU64::new(0),
            shutting_down,
            apply_timeout: Duration::from_millis(options.apply_timeout_ms),
        });

        WriteExecutor::spawn(WriteContext { store, collections }, router, jobs_rx);

        let storage = Arc::new(SiftRaftStorage::new(
            core.clone(),
            options.raft_dir.join(META_DIR_NAME),
        ));

        let node_id = options.api_port as u64;

        Arc::new(Self {
            core,
            storage,
            network: SiftNetworkFactory::new(),
            options,
            node_id,
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub(crate) fn raft_node(&self) -> Option<RaftInstance> {
        self.core.node()
    }

    /// Bring up the consensus node.
    ///
    /// If a persisted snapshot exists the store is rebuilt from it before
    /// joining the cluster; otherwise the store starts fresh (unless a
    /// stand-alone store is being upgraded via `create_init_db_snapshot`).
    pub async fn start(&self) -> Result<()> {
        for dir in [LOG_DIR_NAME, META_DIR_NAME, SNAPSHOT_DIR_NAME] {
            std::fs::create_dir_all(self.options.raft_dir.join(dir))
                .map_err(|e| ReplicationError::NodeInit(e.to_string()))?;
        }

        let nodes_config = effective_nodes_config(
            &self.options.peering_host,
            self.options.peering_port,
            self.options.api_port,
            &self.options.nodes,
        );
        let members = parse_nodes(&nodes_config)?;
        let initial_members: BTreeMap<u64, SiftNode> = members
            .iter()
            .map(|m| (m.node_id(), SiftNode::from(m)))
            .collect();

        match self.core.snapshots.latest()? {
            Some((meta, dir)) => {
                log::info!(
                    "Snapshot {} exists; restoring store before joining the cluster",
                    meta.snapshot_id
                );
                let db_dir = dir.join(DB_SNAPSHOT_NAME);
                let core = self.core.clone();
                tokio::task::spawn_blocking(move || core.restore_store_from(&db_dir))
                    .await
                    .map_err(|e| ReplicationError::Internal(format!("restore task died: {}", e)))??;

                let data = self.core.snapshots.read_archive(&meta.snapshot_id)?.encode()?;
                self.storage.prime_from_snapshot(meta, data);
            }
            None if !self.options.create_init_db_snapshot => {
                log::info!("Snapshot does not exist. We will remove db dir and init db fresh.");
                self.core.reset_db();
                self.core
                    .store
                    .delete_state_dir()
                    .map_err(|e| ReplicationError::StoreOpen(e.to_string()))?;
                self.core.init_db()?;
            }
            None => {
                // keep the stand-alone store; it is snapshotted once a
                // leader exists
                self.core.init_db()?;
            }
        }

        self.spawn_node(initial_members).await?;
        self.spawn_snapshot_timer();

        Ok(())
    }

    async fn spawn_node(&self, initial_members: BTreeMap<u64, SiftNode>) -> Result<()> {
        let election = self.options.election_timeout_ms;
        let config = Config {
            cluster_name: CONSENSUS_GROUP.to_string(),
            election_timeout_min: election,
            election_timeout_max: election * 2,
            heartbeat_interval: (election / 10).max(50),
            install_snapshot_timeout: 10_000,
            // snapshots are driven by the periodic timer, not log growth
            snapshot_policy: SnapshotPolicy::Never,
            ..Default::default()
        };
        let config = Arc::new(
            config
                .validate()
                .map_err(|e| ReplicationError::NodeInit(e.to_string()))?,
        );

        let (log_store, state_machine): (StorageAdaptor, StorageAdaptor) =
            openraft::storage::Adaptor::new(self.storage.clone());

        let raft = Raft::new(
            self.node_id,
            config,
            self.network.clone(),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ReplicationError::NodeInit(format!("{:?}", e)))?;

        *self.core.node.write() = Some(raft.clone());

        if self.storage.is_pristine() {
            match raft.initialize(initial_members.clone()).await {
                Ok(()) => log::info!(
                    "Cluster initialized with {} member(s)",
                    initial_members.len()
                ),
                Err(RaftError::APIError(e)) => match e {
                    InitializeError::NotAllowed(_) => {
                        log::debug!("Cluster already initialized");
                    }
                    other => {
                        return Err(ReplicationError::NodeInit(format!(
                            "Failed to initialize cluster: {}",
                            other
                        )))
                    }
                },
                Err(RaftError::Fatal(e)) => {
                    return Err(ReplicationError::NodeInit(format!(
                        "Fail to init peering node: {}",
                        e
                    )))
                }
            }
        }

        self.spawn_metrics_watcher(raft);
        Ok(())
    }

    /// Keep a relaxed mirror of the leader term for `write` to capture.
    fn spawn_metrics_watcher(&self, raft: RaftInstance) {
        let core = self.core.clone();
        tokio::spawn(async move {
            let mut metrics = raft.metrics();
            loop {
                let current_term = metrics.borrow().current_term;
                core.leader_term.store(current_term, Ordering::Relaxed);
                if metrics.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Periodic snapshots, gated on at least one entry applied since the
    /// last snapshot.
    fn spawn_snapshot_timer(&self) {
        let interval_s = self.options.snapshot_interval_s;
        if interval_s == 0 {
            return;
        }

        let core = self.core.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.tick().await; // immediate first tick

            loop {
                ticker.tick().await;
                if core.shutting_down.load(Ordering::Relaxed) {
                    break;
                }

                let node = match core.node() {
                    Some(node) => node,
                    None => continue,
                };

                let metrics = node.metrics().borrow().clone();
                let applied = metrics.last_applied.map(|id| id.index).unwrap_or(0);
                let snapshotted = metrics.snapshot.map(|id| id.index).unwrap_or(0);

                if applied > snapshotted {
                    log::info!("Triggering periodic snapshot (applied index {})", applied);
                    if let Err(e) = node.trigger().snapshot().await {
                        log::warn!("Periodic snapshot failed: {}", e);
                    }
                }
            }
        });
    }

    /// Replicate a mutating request.
    ///
    /// Leader only: callers must route follower writes through the leader
    /// forwarder. The returned response is delivered by the apply path once
    /// the entry is committed and executed, exactly once per submission.
    pub async fn write(&self, request: ReplicatedRequest) -> Result<StoredResponse> {
        let node = self
            .core
            .node()
            .ok_or_else(|| ReplicationError::node_init("consensus node not started"))?;

        if !self.core.is_leader() {
            return Err(ReplicationError::NotLeader {
                leader_api_addr: self.leader_api_addr(),
            });
        }

        // Captured before submit; the consensus library rejects the
        // submission if leadership changes before the entry commits, and
        // the waiter then sees a term mismatch.
        let expected_term = self.core.leader_term.load(Ordering::Relaxed);

        let payload = encode_request(&request)?;
        let request_id = request.request_id.clone();

        let (responder, completion) = oneshot::channel();
        self.core.pending.register(
            request_id.clone(),
            PendingWrite {
                responder,
                expected_term,
            },
        );

        let core = self.core.clone();
        tokio::spawn(async move {
            if let Err(e) = node.client_write(payload).await {
                // apply never ran for this entry; the submitter owns the
                // pending slot if it is still there
                if let Some(write) = core.pending.take(&request_id) {
                    log::warn!("Write {} rejected by consensus: {}", request_id, e);
                    let current_term = core.leader_term.load(Ordering::Relaxed);
                    let _ = write.responder.send(Err(map_client_write_error(
                        e,
                        write.expected_term,
                        current_term,
                    )));
                }
            }
        });

        completion
            .await
            .map_err(|_| ReplicationError::internal("write completion dropped"))?
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    pub fn current_leader(&self) -> Option<u64> {
        self.core.current_leader()
    }

    /// HTTP API address of the current leader, if known.
    pub fn leader_api_addr(&self) -> Option<String> {
        self.core.leader_node().map(|(_, node)| node.api_addr)
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    pub fn node_state(&self) -> u64 {
        self.core.node_state()
    }

    pub fn init_readiness_count(&self) -> u64 {
        self.core.init_readiness_count.load(Ordering::SeqCst)
    }

    pub fn queued_writes(&self) -> usize {
        self.core.pending.len()
    }

    pub fn status(&self) -> ReplicationStatus {
        let metrics = self.core.metrics();
        ReplicationStatus {
            state: self.core.node_state(),
            leader_id: metrics.as_ref().and_then(|m| m.current_leader),
            current_term: metrics.as_ref().map(|m| m.current_term).unwrap_or(0),
            committed_index: metrics
                .as_ref()
                .and_then(|m| m.last_applied)
                .map(|id| id.index)
                .unwrap_or(0),
            queued_writes: self.core.pending.len(),
            init_readiness_count: self.init_readiness_count(),
            reset_peers_count: self.core.reset_peers_count.load(Ordering::SeqCst),
        }
    }

    /// Apply a new cluster configuration.
    ///
    /// Leaders change membership through consensus. A leaderless node only
    /// ever resets itself when the new configuration is a singleton: the
    /// deliberate, unsafe recovery for a single node whose IP changed.
    pub async fn refresh_nodes(&self, nodes: &str) -> Result<()> {
        let node = match self.core.node() {
            Some(node) => node,
            None => {
                log::warn!("Node state is not initialized: unable to refresh nodes.");
                return Ok(());
            }
        };

        let members = parse_nodes(nodes)?;
        let target: BTreeMap<u64, SiftNode> = members
            .iter()
            .map(|m| (m.node_id(), SiftNode::from(m)))
            .collect();

        if self.core.is_leader() {
            let metrics = node.metrics().borrow().clone();
            let known: HashSet<u64> = metrics
                .membership_config
                .membership()
                .nodes()
                .map(|(id, _)| *id)
                .collect();

            for (id, member) in &target {
                if !known.contains(id) {
                    node.add_learner(*id, member.clone(), false)
                        .await
                        .map_err(|e| {
                            ReplicationError::Network(format!(
                                "Failed to add learner {}: {}",
                                id, e
                            ))
                        })?;
                }
            }

            let ids: BTreeSet<u64> = target.keys().copied().collect();
            node.change_membership(ids, false)
                .await
                .map_err(|e| ReplicationError::Network(format!("change_peers failed: {}", e)))?;
            log::info!("Membership changed to {} node(s)", target.len());
        } else if self.core.current_leader().is_none() {
            if target.len() == 1 {
                log::warn!("Single-node with no leader. Resetting peers.");
                self.reset_peers(target).await?;
            } else {
                log::warn!("Multi-node with no leader: refusing to reset peers.");
            }
        }

        Ok(())
    }

    /// Forcefully overwrite membership and restart the consensus node.
    ///
    /// Consistency guarantees are given up here; the only supported use is
    /// a single-node cluster recovering from an IP change.
    async fn reset_peers(&self, target: BTreeMap<u64, SiftNode>) -> Result<()> {
        self.core.reset_peers_count.fetch_add(1, Ordering::SeqCst);

        if let Some(old) = self.core.node.write().take() {
            if let Err(e) = old.shutdown().await {
                log::warn!("Error shutting down node before peer reset: {}", e);
            }
        }

        let membership: Membership<u64, SiftNode> = target.clone().into();
        self.storage.force_membership(membership);

        self.spawn_node(target).await
    }

    /// Trigger a snapshot now.
    pub async fn trigger_snapshot(&self) -> Result<()> {
        let node = self
            .core
            .node()
            .ok_or_else(|| ReplicationError::node_init("consensus node not started"))?;
        node.trigger()
            .snapshot()
            .await
            .map_err(|e| ReplicationError::Internal(e.to_string()))
    }

    /// Trigger a leader election now.
    pub async fn trigger_election(&self) -> Result<()> {
        let node = self
            .core
            .node()
            .ok_or_else(|| ReplicationError::node_init("consensus node not started"))?;
        node.trigger()
            .elect()
            .await
            .map_err(|e| ReplicationError::Internal(e.to_string()))
    }

    /// Append the snapshot sentinel, turning a stand-alone store into a
    /// replicated one once the entry applies.
    pub async fn submit_init_snapshot(&self) -> Result<()> {
        let node = self
            .core
            .node()
            .ok_or_else(|| ReplicationError::node_init("consensus node not started"))?;

        let payload = encode_request(&ReplicatedRequest::init_snapshot())?;
        node.client_write(payload)
            .await
            .map_err(|e| ReplicationError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Wait until some node is known to be leader, up to `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.core.current_leader().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    /// Fail in-flight writes and stop the consensus node.
    pub async fn shutdown(&self) {
        self.core.pending.fail_all();

        let node = self.core.node.write().take();
        if let Some(node) = node {
            if let Err(e) = node.shutdown().await {
                log::warn!("Error during consensus shutdown: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationState")
            .field("node_id", &self.node_id)
            .field("state", &self.node_state())
            .finish_non_exhaustive()
    }
}

/// Translate a failed submission into the error its waiter receives.
///
/// A submission only runs on a node that was leader at capture time, so a
/// forward-to-leader rejection here means leadership moved between submit
/// and commit: the write from the expected term was never acknowledged.
fn map_client_write_error(
    err: RaftError<u64, ClientWriteError<u64, SiftNode>>,
    expected_term: u64,
    current_term: u64,
) -> ReplicationError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => {
            ReplicationError::TermMismatch {
                expected: expected_term,
                current: current_term,
            }
        }
        RaftError::APIError(other) => ReplicationError::Internal(other.to_string()),
        RaftError::Fatal(fatal) => ReplicationError::NodeInit(fatal.to_string()),
    }
}
