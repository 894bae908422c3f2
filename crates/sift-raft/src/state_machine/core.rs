//! Shared internals of the replication state machine.
//!
//! [`ReplicationCore`] is the piece both sides of the system hold: the
//! consensus storage calls into it to apply committed entries and to build
//! or install snapshots, while [`super::ReplicationState`] drives it from
//! the HTTP-facing API.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use openraft::{LogId, Raft, RaftMetrics, ServerState, SnapshotMeta};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use sift_store::{CollectionManager, Store};

use crate::codec::{decode_request, StoredResponse};
use crate::error::{ReplicationError, Result};
use crate::snapshot::{link_or_copy_dir, SnapshotArchive, SnapshotDriver, SnapshotRepository};
use crate::state_machine::executor::{ApplyJob, Teardown};
use crate::state_machine::pending::{ApplyOrigin, PendingWrites};
use crate::storage::{SiftNode, SiftTypeConfig, StoredSnapshot};

pub(crate) type RaftInstance = Raft<SiftTypeConfig>;

pub(crate) struct ReplicationCore {
    pub(crate) store: Arc<Store>,
    pub(crate) collections: Arc<CollectionManager>,

    /// In-flight leader writes, keyed by request id.
    pub(crate) pending: PendingWrites,

    /// Channel into the write executor.
    pub(crate) jobs_tx: mpsc::Sender<ApplyJob>,

    /// The consensus node, set once `start` completes and swapped during a
    /// forced peer reset.
    pub(crate) node: RwLock<Option<RaftInstance>>,

    pub(crate) snapshots: SnapshotRepository,

    /// Relaxed mirror of the leader term, captured by `write` to detect
    /// leadership changes between submit and apply.
    pub(crate) leader_term: AtomicU64,

    /// Times the store was opened and collections loaded successfully.
    pub(crate) init_readiness_count: AtomicU64,

    /// Times the unsafe single-node peer reset ran.
    pub(crate) reset_peers_count: AtomicU64,

    /// Process-wide shutdown flag, polled by the apply loop.
    pub(crate) shutting_down: Arc<AtomicBool>,

    /// Upper bound on the apply-side wait for the worker gate.
    pub(crate) apply_timeout: Duration,
}

impl ReplicationCore {
    pub(crate) fn node(&self) -> Option<RaftInstance> {
        self.node.read().clone()
    }

    pub(crate) fn metrics(&self) -> Option<RaftMetrics<u64, SiftNode>> {
        self.node().map(|node| node.metrics().borrow().clone())
    }

    pub(crate) fn is_leader(&self) -> bool {
        match self.metrics() {
            Some(metrics) => metrics.current_leader == Some(metrics.id),
            None => false,
        }
    }

    pub(crate) fn current_leader(&self) -> Option<u64> {
        self.metrics().and_then(|m| m.current_leader)
    }

    /// The leader's membership record, if a leader is known.
    pub(crate) fn leader_node(&self) -> Option<(u64, SiftNode)> {
        let metrics = self.metrics()?;
        let leader_id = metrics.current_leader?;
        let node = metrics
            .membership_config
            .membership()
            .nodes()
            .find(|(id, _)| **id == leader_id)
            .map(|(_, node)| node.clone())?;
        Some((leader_id, node))
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.init_readiness_count.load(Ordering::SeqCst) > 0
    }

    /// Node exists, the store has been initialized at least once, and the
    /// node is either a leader or knows one.
    pub(crate) fn is_alive(&self) -> bool {
        let metrics = match self.metrics() {
            Some(metrics) => metrics,
            None => return false,
        };
        if !self.is_ready() {
            return false;
        }
        metrics.current_leader.is_some()
    }

    /// Raw consensus state code; zero when the node is absent.
    pub(crate) fn node_state(&self) -> u64 {
        match self.metrics() {
            None => 0,
            Some(metrics) => match metrics.state {
                ServerState::Learner => 1,
                ServerState::Follower => 2,
                ServerState::Candidate => 3,
                ServerState::Leader => 4,
                ServerState::Shutdown => 5,
            },
        }
    }

    /// Open the store and load collections. Any failure here is fatal at
    /// startup.
    pub(crate) fn init_db(&self) -> Result<()> {
        std::fs::create_dir_all(self.store.state_dir_path())
            .map_err(|e| ReplicationError::StoreOpen(e.to_string()))?;

        self.store
            .open()
            .map_err(|e| ReplicationError::StoreOpen(e.to_string()))?;
        log::info!("DB open success!");

        log::info!("Loading collections from disk...");
        self.collections
            .load()
            .map_err(|e| ReplicationError::CollectionsLoad(e.to_string()))?;

        self.init_readiness_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn reset_db(&self) {
        self.store.close();
    }

    /// Replace the store's on-disk state with a snapshot's `db_snapshot/`
    /// directory, then reopen.
    pub(crate) fn restore_store_from(&self, snapshot_db_dir: &Path) -> Result<()> {
        self.reset_db();
        self.store
            .delete_state_dir()
            .map_err(|e| ReplicationError::StoreOpen(e.to_string()))?;

        link_or_copy_dir(snapshot_db_dir, self.store.state_dir_path()).map_err(|e| {
            ReplicationError::StoreOpen(format!(
                "copy snapshot {} to {} failed: {}",
                snapshot_db_dir.display(),
                self.store.state_dir_path().display(),
                e
            ))
        })?;

        log::info!(
            "copy snapshot {} to {} success",
            snapshot_db_dir.display(),
            self.store.state_dir_path().display()
        );

        self.init_db()
    }

    /// Apply one committed entry: rendezvous with the write executor and
    /// deliver the response to a local origin, if any. Never errors: a
    /// committed entry must always be consumed.
    pub(crate) async fn apply_entry(self: &Arc<Self>, log_id: LogId<u64>, data: &[u8]) -> Vec<u8> {
        let index = log_id.index;

        let request = match decode_request(data) {
            Ok(request) => request,
            Err(e) => {
                log::error!("Failed to decode log entry {}: {}", index, e);
                return Vec::new();
            }
        };

        if request.is_init_snapshot() {
            // cold snapshot of a pre-existing stand-alone store
            self.schedule_init_snapshot();
            return Vec::new();
        }

        // A committed entry found in the pending table originated here; a
        // submission that lost leadership first never reaches this point
        // (its waiter was failed on the submit path).
        let origin = match self.pending.take(&request.request_id) {
            Some(write) => ApplyOrigin::Local(write),
            None => ApplyOrigin::Remote,
        };

        self.collections.set_applying_index(index);

        let method = request.method.clone();
        let path = request.path.clone();

        let (gate_tx, gate_rx) = oneshot::channel();
        if self
            .jobs_tx
            .send(ApplyJob {
                request,
                signal: gate_tx,
            })
            .await
            .is_err()
        {
            log::error!("Write executor is gone; failing entry {}", index);
            if let ApplyOrigin::Local(write) = origin {
                let _ = write
                    .responder
                    .send(Ok(StoredResponse::server_error("Write dispatch failed.")));
            }
            return Vec::new();
        }

        // Bounded wait: a silently dead worker must not stall the apply
        // loop forever.
        let response = match tokio::time::timeout(self.apply_timeout, gate_rx).await {
            Ok(Ok(Teardown::FreedByApply(response))) => Some(response),
            Ok(Ok(Teardown::FreedByWorker)) => None,
            Ok(Err(_)) | Err(_) => {
                log::error!(
                    "Worker never completed {} {} at index {}",
                    method,
                    path,
                    index
                );
                Some(StoredResponse::server_error("Write dispatch failed."))
            }
        };

        if let ApplyOrigin::Local(write) = origin {
            match response {
                Some(response) => {
                    let _ = write.responder.send(Ok(response));
                }
                // the worker took over delivery
                None => drop(write),
            }
        }

        Vec::new()
    }

    /// Trigger a one-shot snapshot from the apply path without blocking it,
    /// then reopen the store once the snapshot lands.
    pub(crate) fn schedule_init_snapshot(self: &Arc<Self>) {
        log::info!("Triggering init snapshot against stand-alone store");

        let core = self.clone();
        tokio::spawn(async move {
            let node = match core.node() {
                Some(node) => node,
                None => return,
            };

            let target_index = node
                .metrics()
                .borrow()
                .last_applied
                .map(|id| id.index)
                .unwrap_or(0);

            if let Err(e) = node.trigger().snapshot().await {
                log::error!("Init snapshot failed, error: {}", e);
                return;
            }

            if core.wait_for_snapshot(&node, target_index).await {
                log::info!("Init snapshot succeeded!");
                core.reset_db();
                if let Err(e) = core.init_db() {
                    log::error!("Failed to reopen store after init snapshot: {}", e);
                }
            } else {
                log::error!("Init snapshot did not complete in time");
            }
        });
    }

    /// Poll metrics until a snapshot at or past `target_index` exists.
    async fn wait_for_snapshot(&self, node: &RaftInstance, target_index: u64) -> bool {
        for _ in 0..600 {
            let snapshot_index = node
                .metrics()
                .borrow()
                .snapshot
                .map(|id| id.index)
                .unwrap_or(0);
            if snapshot_index >= target_index && snapshot_index > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    /// Build a snapshot of the store. Runs the checkpoint on a blocking
    /// task; commits and prunes the on-disk snapshot repository.
    pub(crate) async fn capture_snapshot(
        &self,
        meta: SnapshotMeta<u64, SiftNode>,
    ) -> Result<StoredSnapshot> {
        let target_dir = self.snapshots.snapshot_dir(&meta.snapshot_id);
        let driver = SnapshotDriver::new(self.store.clone());

        let archive = tokio::task::spawn_blocking(move || driver.capture(&target_dir))
            .await
            .map_err(|e| ReplicationError::Internal(format!("snapshot task died: {}", e)))??;

        self.snapshots.commit_meta(&meta.snapshot_id, &meta)?;
        self.snapshots.prune_except(&meta.snapshot_id);

        let data = archive.encode()?;
        log::info!(
            "Snapshot {} committed ({} bytes)",
            meta.snapshot_id,
            data.len()
        );

        Ok(StoredSnapshot { meta, data })
    }

    /// Install a snapshot received from a peer: persist it, then rebuild
    /// the store from its files.
    pub(crate) async fn install_snapshot_archive(
        self: &Arc<Self>,
        meta: &SnapshotMeta<u64, SiftNode>,
        data: &[u8],
    ) -> Result<()> {
        let archive = SnapshotArchive::decode(data)?;
        let dir = self.snapshots.install(meta, &archive)?;
        self.snapshots.prune_except(&meta.snapshot_id);

        let core = self.clone();
        let db_dir = dir.join(sift_commons::constants::DB_SNAPSHOT_NAME);
        tokio::task::spawn_blocking(move || core.restore_store_from(&db_dir))
            .await
            .map_err(|e| ReplicationError::Internal(format!("restore task died: {}", e)))?
    }
}
