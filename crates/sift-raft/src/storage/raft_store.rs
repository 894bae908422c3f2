//! Combined consensus storage.
//!
//! Implements the combined `RaftStorage` trait (v1 API): log storage, state
//! machine operations and snapshot building in one type, wired to openraft
//! through `Adaptor`.
//!
//! The log lives in memory; vote and committed-index survive restarts as
//! JSON files under `raft_dir/meta/`, and snapshots survive under
//! `raft_dir/snapshot/` (see [`crate::snapshot`]). After a restart the log
//! is rebuilt from the latest snapshot plus replication from the leader.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftStorage, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, Membership, OptionalSend, RaftSnapshotBuilder, SnapshotMeta,
    StorageError, StorageIOError, StoredMembership, Vote,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::state_machine::core::ReplicationCore;
use crate::storage::types::{SiftNode, SiftTypeConfig};

const VOTE_FILE: &str = "vote.json";
const COMMITTED_FILE: &str = "committed.json";

/// Type alias for the storage adaptor handed to `Raft::new`.
pub type StorageAdaptor = openraft::storage::Adaptor<SiftTypeConfig, Arc<SiftRaftStorage>>;

/// A built snapshot: its meta plus the encoded file archive.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub meta: SnapshotMeta<u64, SiftNode>,
    pub data: Vec<u8>,
}

/// Log entry held in memory; the payload stays serialized so the log is
/// oblivious to payload evolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntryData {
    log_id: LogId<u64>,
    payload: Vec<u8>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Combined log + state machine + snapshot storage.
pub struct SiftRaftStorage {
    core: Arc<ReplicationCore>,

    /// Directory for vote/committed persistence.
    meta_dir: PathBuf,

    log: RwLock<BTreeMap<u64, LogEntryData>>,
    vote: RwLock<Option<Vote<u64>>>,
    committed: RwLock<Option<LogId<u64>>>,
    last_purged: RwLock<Option<LogId<u64>>>,

    last_applied: RwLock<Option<LogId<u64>>>,
    last_membership: RwLock<StoredMembership<u64, SiftNode>>,

    snapshot_idx: AtomicU64,
    current_snapshot: RwLock<Option<StoredSnapshot>>,
}

impl Debug for SiftRaftStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiftRaftStorage")
            .field("meta_dir", &self.meta_dir)
            .field("last_applied", &*self.last_applied.read())
            .finish_non_exhaustive()
    }
}

impl SiftRaftStorage {
    /// Create the storage, recovering vote and committed index from
    /// `meta_dir` when present.
    pub(crate) fn new(core: Arc<ReplicationCore>, meta_dir: impl Into<PathBuf>) -> Self {
        let meta_dir = meta_dir.into();

        let vote = read_meta_file(&meta_dir.join(VOTE_FILE));
        let committed = read_meta_file(&meta_dir.join(COMMITTED_FILE));

        Self {
            core,
            meta_dir,
            log: RwLock::new(BTreeMap::new()),
            vote: RwLock::new(vote),
            committed: RwLock::new(committed),
            last_purged: RwLock::new(None),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot_idx: AtomicU64::new(0),
            current_snapshot: RwLock::new(None),
        }
    }

    /// Seed applied-state and current snapshot from a locally persisted
    /// snapshot, so entries covered by it are not re-applied after restart.
    /// The log is empty at this point; everything up to the snapshot index
    /// counts as purged.
    pub fn prime_from_snapshot(&self, meta: SnapshotMeta<u64, SiftNode>, data: Vec<u8>) {
        *self.last_applied.write() = meta.last_log_id;
        *self.last_purged.write() = meta.last_log_id;
        *self.last_membership.write() = meta.last_membership.clone();
        *self.current_snapshot.write() = Some(StoredSnapshot { meta, data });
    }

    /// True when nothing was ever persisted: safe to bootstrap membership.
    pub fn is_pristine(&self) -> bool {
        self.vote.read().is_none()
            && self.log.read().is_empty()
            && self.last_applied.read().is_none()
            && self
                .last_membership
                .read()
                .membership()
                .nodes()
                .next()
                .is_none()
    }

    /// Overwrite the stored membership, bypassing consensus entirely.
    ///
    /// This is the storage half of the unsafe single-node `reset_peers`
    /// recovery; the caller is responsible for the singleton check and for
    /// restarting the consensus node afterwards. Unapplied log entries are
    /// dropped, since a membership entry still sitting in the log would
    /// otherwise override the forced configuration on restart.
    pub fn force_membership(&self, membership: Membership<u64, SiftNode>) {
        self.log.write().clear();
        *self.last_membership.write() = StoredMembership::new(None, membership);
    }

    fn persist_meta_file<T: Serialize>(&self, name: &str, value: &T) {
        let path = self.meta_dir.join(name);
        match encode(value) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    log::warn!("Failed to persist {}: {}", path.display(), e);
                }
            }
            Err(e) => log::warn!("Failed to serialize {}: {}", name, e),
        }
    }

    fn get_log_entries_sync(&self, range: impl RangeBounds<u64>) -> Vec<Entry<SiftTypeConfig>> {
        let log = self.log.read();
        log.range(range)
            .map(|(_, entry)| match decode::<EntryPayload<SiftTypeConfig>>(&entry.payload) {
                Ok(payload) => Entry {
                    log_id: entry.log_id,
                    payload,
                },
                Err(e) => {
                    log::warn!("Failed to decode log entry {}: {}", entry.log_id, e);
                    Entry {
                        log_id: entry.log_id,
                        payload: EntryPayload::Blank,
                    }
                }
            })
            .collect()
    }
}

fn read_meta_file<T: DeserializeOwned>(path: &std::path::Path) -> Option<T> {
    let bytes = std::fs::read(path).ok()?;
    match decode(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring corrupt meta file {}: {}", path.display(), e);
            None
        }
    }
}

/// Log reader sharing access to the storage.
pub struct SiftLogReader {
    storage: Arc<SiftRaftStorage>,
}

impl Clone for SiftLogReader {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

impl RaftLogReader<SiftTypeConfig> for SiftLogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<SiftTypeConfig>>, StorageError<u64>> {
        Ok(self.storage.get_log_entries_sync(range))
    }
}

/// Snapshot builder: checkpoints the store through the replication core.
pub struct SiftSnapshotBuilder {
    storage: Arc<SiftRaftStorage>,
}

impl RaftSnapshotBuilder<SiftTypeConfig> for SiftSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<SiftTypeConfig>, StorageError<u64>> {
        let last_applied = *self.storage.last_applied.read();
        let last_membership = self.storage.last_membership.read().clone();

        let snapshot_idx = self.storage.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied {
            format!("{}-{}-{}", last.leader_id, last.index, snapshot_idx)
        } else {
            format!("--{}", snapshot_idx)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        let stored = self
            .storage
            .core
            .capture_snapshot(meta.clone())
            .await
            .map_err(|e| {
                StorageIOError::write_snapshot(
                    Some(meta.signature()),
                    &std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;

        let data = stored.data.clone();
        *self.storage.current_snapshot.write() = Some(stored);

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftLogReader<SiftTypeConfig> for Arc<SiftRaftStorage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<SiftTypeConfig>>, StorageError<u64>> {
        Ok(self.get_log_entries_sync(range))
    }
}

#[allow(deprecated)] // RaftStorage is the v1 API; the v2 split traits are sealed
impl RaftStorage<SiftTypeConfig> for Arc<SiftRaftStorage> {
    type LogReader = SiftLogReader;
    type SnapshotBuilder = SiftSnapshotBuilder;

    // --- Vote ---

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        *self.vote.write() = Some(vote.clone());
        self.persist_meta_file(VOTE_FILE, vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(self.vote.read().clone())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), StorageError<u64>> {
        *self.committed.write() = committed;
        self.persist_meta_file(COMMITTED_FILE, &committed);
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        Ok(*self.committed.read())
    }

    // --- Log ---

    async fn get_log_state(&mut self) -> Result<LogState<SiftTypeConfig>, StorageError<u64>> {
        let log = self.log.read();
        let last_purged = *self.last_purged.read();
        let last_log_id = log.iter().next_back().map(|(_, e)| e.log_id).or(last_purged);

        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        SiftLogReader {
            storage: self.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<SiftTypeConfig>> + OptionalSend,
    {
        let mut log = self.log.write();

        for entry in entries {
            let payload = encode(&entry.payload)
                .map_err(|e| StorageIOError::write_logs(&e))?;
            log.insert(
                entry.log_id.index,
                LogEntryData {
                    log_id: entry.log_id,
                    payload,
                },
            );
        }

        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write();
        let keys: Vec<u64> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write();
        let keys: Vec<u64> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        *self.last_purged.write() = Some(log_id);
        Ok(())
    }

    // --- State machine ---

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, SiftNode>), StorageError<u64>> {
        Ok((
            *self.last_applied.read(),
            self.last_membership.read().clone(),
        ))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<SiftTypeConfig>],
    ) -> Result<Vec<Vec<u8>>, StorageError<u64>> {
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let log_id = entry.log_id;
            *self.last_applied.write() = Some(log_id);

            match &entry.payload {
                EntryPayload::Blank => results.push(Vec::new()),
                EntryPayload::Normal(data) => {
                    let response = self.core.apply_entry(log_id, data).await;
                    results.push(response);
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write() =
                        StoredMembership::new(Some(log_id), membership.clone());
                    results.push(Vec::new());
                }
            }

            // A set shutdown flag rolls back the rest of the batch: the
            // consensus loop surfaces an error instead of acknowledging.
            if self
                .core
                .shutting_down
                .load(std::sync::atomic::Ordering::Relaxed)
            {
                let interrupted =
                    std::io::Error::new(std::io::ErrorKind::Interrupted, "shutting down");
                return Err(StorageIOError::write_state_machine(&interrupted).into());
            }
        }

        Ok(results)
    }

    // --- Snapshot ---

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SiftSnapshotBuilder {
            storage: self.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, SiftNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        // Leaders never install snapshots; only followers receive them.
        if self.core.is_leader() {
            let err = std::io::Error::new(
                std::io::ErrorKind::Other,
                "leader is not supposed to load snapshot",
            );
            return Err(StorageIOError::read_snapshot(Some(meta.signature()), &err).into());
        }

        log::info!("Installing snapshot {}", meta.snapshot_id);
        let data = snapshot.into_inner();

        self.core
            .install_snapshot_archive(meta, &data)
            .await
            .map_err(|e| {
                StorageIOError::read_snapshot(
                    Some(meta.signature()),
                    &std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
                )
            })?;

        *self.last_applied.write() = meta.last_log_id;
        *self.last_membership.write() = meta.last_membership.clone();
        *self.current_snapshot.write() = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });

        if let Some(last_log_id) = meta.last_log_id {
            let mut log = self.log.write();
            let keys: Vec<u64> = log.range(..=last_log_id.index).map(|(k, _)| *k).collect();
            for key in keys {
                log.remove(&key);
            }
            *self.last_purged.write() = Some(last_log_id);
        }

        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<SiftTypeConfig>>, StorageError<u64>> {
        let current = self.current_snapshot.read();
        Ok(current.as_ref().map(|snapshot| Snapshot {
            meta: snapshot.meta.clone(),
            snapshot: Box::new(Cursor::new(snapshot.data.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::time::Duration;

    use openraft::CommittedLeaderId;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::snapshot::SnapshotRepository;
    use crate::state_machine::pending::PendingWrites;

    fn test_storage(dir: &TempDir) -> Arc<SiftRaftStorage> {
        let meta_dir = dir.path().join("raft/meta");
        std::fs::create_dir_all(&meta_dir).unwrap();

        let store = Arc::new(sift_store::Store::new(dir.path().join("state")));
        let collections = Arc::new(sift_store::CollectionManager::new(store.clone()));
        let (jobs_tx, _jobs_rx) = mpsc::channel(4);

        let core = Arc::new(ReplicationCore {
            store,
            collections,
            pending: PendingWrites::default(),
            jobs_tx,
            node: parking_lot::RwLock::new(None),
            snapshots: SnapshotRepository::new(dir.path().join("raft/snapshot")),
            leader_term: AtomicU64::new(0),
            init_readiness_count: AtomicU64::new(0),
            reset_peers_count: AtomicU64::new(0),
            shutting_down: Arc::new(AtomicBool::new(false)),
            apply_timeout: Duration::from_secs(1),
        });

        Arc::new(SiftRaftStorage::new(core, meta_dir))
    }

    fn entry(index: u64) -> Entry<SiftTypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Blank,
        }
    }

    #[tokio::test]
    async fn vote_survives_restart() {
        let dir = TempDir::new().unwrap();

        {
            let mut storage = test_storage(&dir);
            assert!(storage.read_vote().await.unwrap().is_none());
            storage.save_vote(&Vote::new(3, 8108)).await.unwrap();
        }

        // a fresh storage over the same meta dir recovers the vote
        let mut storage = test_storage(&dir);
        assert_eq!(storage.read_vote().await.unwrap(), Some(Vote::new(3, 8108)));
    }

    #[tokio::test]
    async fn log_append_and_purge() {
        let dir = TempDir::new().unwrap();
        let mut storage = test_storage(&dir);

        let state = storage.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());

        storage
            .append_to_log(vec![entry(1), entry(2), entry(3)])
            .await
            .unwrap();
        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 3);

        storage
            .purge_logs_upto(LogId::new(CommittedLeaderId::new(1, 1), 2))
            .await
            .unwrap();
        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 2);
        assert_eq!(state.last_log_id.unwrap().index, 3);

        let entries = storage.try_get_log_entries(0..=10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id.index, 3);
    }

    #[tokio::test]
    async fn force_membership_drops_stale_log() {
        let dir = TempDir::new().unwrap();
        let mut storage = test_storage(&dir);
        assert!(storage.is_pristine());

        storage.append_to_log(vec![entry(1)]).await.unwrap();
        assert!(!storage.is_pristine());

        let node = SiftNode::new("127.0.0.1:7100", "127.0.0.1:8108");
        let mut members = std::collections::BTreeMap::new();
        members.insert(8108u64, node);
        storage.force_membership(members.into());

        // the stale entry is gone and the forced membership is in place
        let state = storage.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        let (_, membership) = storage.last_applied_state().await.unwrap();
        assert_eq!(membership.membership().nodes().count(), 1);
    }
}
