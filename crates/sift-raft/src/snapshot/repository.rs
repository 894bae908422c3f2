//! Persisted snapshots.
//!
//! Layout under `raft_dir/snapshot/`:
//!
//! ```text
//! snapshot/
//!   <snapshot_id>/
//!     meta.json            # openraft SnapshotMeta
//!     db_snapshot/         # checkpointed store files
//! ```
//!
//! Keeping the files unpacked lets a restarting node restore its store
//! locally, before the consensus node even comes up.

use std::path::{Path, PathBuf};

use openraft::SnapshotMeta;

use sift_commons::constants::DB_SNAPSHOT_NAME;

use super::{SnapshotArchive, SnapshotFile};
use crate::error::ReplicationError;
use crate::storage::SiftNode;

const META_FILE_NAME: &str = "meta.json";

type Meta = SnapshotMeta<u64, SiftNode>;

/// On-disk home of completed snapshots.
pub struct SnapshotRepository {
    root: PathBuf,
}

impl SnapshotRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether any completed snapshot exists.
    pub fn has_snapshot(&self) -> bool {
        self.list().map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Directory reserved for the snapshot with the given id.
    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.root.join(snapshot_id)
    }

    /// Write the meta file, marking the snapshot directory complete.
    pub fn commit_meta(&self, snapshot_id: &str, meta: &Meta) -> Result<(), ReplicationError> {
        let dir = self.snapshot_dir(snapshot_id);
        std::fs::create_dir_all(&dir).map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;

        let payload = serde_json::to_vec_pretty(meta)
            .map_err(|e| ReplicationError::Serialization(e.to_string()))?;
        std::fs::write(dir.join(META_FILE_NAME), payload)
            .map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;
        Ok(())
    }

    /// Unpack a received archive into the snapshot directory and commit it.
    pub fn install(
        &self,
        meta: &Meta,
        archive: &SnapshotArchive,
    ) -> Result<PathBuf, ReplicationError> {
        let dir = self.snapshot_dir(&meta.snapshot_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;
        }

        for file in &archive.files {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;
            }
            std::fs::write(&target, &file.data)
                .map_err(|e| ReplicationError::SnapshotAddFile(format!("{}: {}", file.path, e)))?;
        }

        self.commit_meta(&meta.snapshot_id, meta)?;
        Ok(dir)
    }

    /// Read the files of a committed snapshot back into an archive.
    pub fn read_archive(&self, snapshot_id: &str) -> Result<SnapshotArchive, ReplicationError> {
        let db_dir = self.snapshot_dir(snapshot_id).join(DB_SNAPSHOT_NAME);
        let mut archive = SnapshotArchive::default();

        let entries = std::fs::read_dir(&db_dir)
            .map_err(|e| ReplicationError::Checkpoint(format!("{}: {}", db_dir.display(), e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| ReplicationError::SnapshotAddFile(e.to_string()))?;
            if !entry.path().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let data = std::fs::read(entry.path())
                .map_err(|e| ReplicationError::SnapshotAddFile(format!("{}: {}", file_name, e)))?;
            archive.files.push(SnapshotFile {
                path: format!("{}/{}", DB_SNAPSHOT_NAME, file_name),
                data,
            });
        }

        Ok(archive)
    }

    /// The committed snapshot with the highest applied log index, if any.
    pub fn latest(&self) -> Result<Option<(Meta, PathBuf)>, ReplicationError> {
        let mut best: Option<(Meta, PathBuf)> = None;

        for (meta, dir) in self.list()? {
            let index = meta.last_log_id.map(|id| id.index).unwrap_or(0);
            let best_index = best
                .as_ref()
                .and_then(|(m, _)| m.last_log_id.map(|id| id.index))
                .unwrap_or(0);
            if best.is_none() || index > best_index {
                best = Some((meta, dir));
            }
        }

        Ok(best)
    }

    /// Remove every committed snapshot except the named one.
    pub fn prune_except(&self, keep_snapshot_id: &str) {
        let snapshots = match self.list() {
            Ok(s) => s,
            Err(_) => return,
        };

        for (meta, dir) in snapshots {
            if meta.snapshot_id == keep_snapshot_id {
                continue;
            }
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                log::warn!("Failed to prune old snapshot {}: {}", dir.display(), e);
            } else {
                log::info!("Pruned old snapshot {}", meta.snapshot_id);
            }
        }
    }

    fn list(&self) -> Result<Vec<(Meta, PathBuf)>, ReplicationError> {
        let mut out = Vec::new();

        if !self.root.exists() {
            return Ok(out);
        }

        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| ReplicationError::Checkpoint(e.to_string()))?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            let meta_path = dir.join(META_FILE_NAME);
            let raw = match std::fs::read(&meta_path) {
                Ok(raw) => raw,
                // no meta file: an in-progress or aborted snapshot
                Err(_) => continue,
            };

            match serde_json::from_slice::<Meta>(&raw) {
                Ok(meta) => out.push((meta, dir)),
                Err(e) => log::warn!("Ignoring snapshot with corrupt meta {}: {}", dir.display(), e),
            }
        }

        Ok(out)
    }
}

/// Populate `dst` with the files of `src` (non-recursive), hard-linking
/// where the filesystem allows it and copying otherwise.
pub fn link_or_copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }

        let target = dst.join(entry.file_name());
        if std::fs::hard_link(entry.path(), &target).is_err() {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{LogId, StoredMembership};
    use tempfile::TempDir;

    fn meta(snapshot_id: &str, index: u64) -> Meta {
        SnapshotMeta {
            last_log_id: Some(LogId::new(openraft::CommittedLeaderId::new(1, 1), index)),
            last_membership: StoredMembership::default(),
            snapshot_id: snapshot_id.to_string(),
        }
    }

    fn archive() -> SnapshotArchive {
        SnapshotArchive {
            files: vec![SnapshotFile {
                path: format!("{}/CURRENT", DB_SNAPSHOT_NAME),
                data: b"MANIFEST-000001\n".to_vec(),
            }],
        }
    }

    #[test]
    fn install_then_latest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let repo = SnapshotRepository::new(dir.path().join("snapshot"));
        assert!(!repo.has_snapshot());

        repo.install(&meta("1-10-1", 10), &archive()).unwrap();
        repo.install(&meta("1-25-2", 25), &archive()).unwrap();

        assert!(repo.has_snapshot());
        let (latest, latest_dir) = repo.latest().unwrap().unwrap();
        assert_eq!(latest.snapshot_id, "1-25-2");
        assert!(latest_dir.join(DB_SNAPSHOT_NAME).join("CURRENT").exists());

        let read_back = repo.read_archive("1-25-2").unwrap();
        assert_eq!(read_back.files.len(), 1);
        assert_eq!(read_back.files[0].data, b"MANIFEST-000001\n".to_vec());
    }

    #[test]
    fn prune_keeps_only_named_snapshot() {
        let dir = TempDir::new().unwrap();
        let repo = SnapshotRepository::new(dir.path().join("snapshot"));

        repo.install(&meta("1-10-1", 10), &archive()).unwrap();
        repo.install(&meta("1-25-2", 25), &archive()).unwrap();

        repo.prune_except("1-25-2");
        let (latest, _) = repo.latest().unwrap().unwrap();
        assert_eq!(latest.snapshot_id, "1-25-2");
        assert!(!repo.snapshot_dir("1-10-1").exists());
    }

    #[test]
    fn uncommitted_directories_are_ignored() {
        let dir = TempDir::new().unwrap();
        let repo = SnapshotRepository::new(dir.path().join("snapshot"));

        // directory without meta.json, as left by an aborted capture
        std::fs::create_dir_all(repo.snapshot_dir("half-done")).unwrap();
        assert!(!repo.has_snapshot());
        assert!(repo.latest().unwrap().is_none());
    }

    #[test]
    fn link_or_copy_replicates_files() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.sst"), b"data").unwrap();

        link_or_copy_dir(&src, &dst).unwrap();
        assert_eq!(std::fs::read(dst.join("a.sst")).unwrap(), b"data");
    }
}
