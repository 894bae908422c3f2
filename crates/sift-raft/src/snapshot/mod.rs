//! Checkpoint-based snapshots.
//!
//! A snapshot is a directory holding a single `db_snapshot/` sub-directory
//! of hard-linked store files, captured at the log index the snapshot was
//! taken at. For shipping between peers the files are packed into a
//! flexbuffers archive; on disk under `raft_dir/snapshot/<snapshot_id>/`
//! they stay plain files so a restarting node can restore without the
//! leader's help.

mod driver;
mod repository;

pub use driver::SnapshotDriver;
pub use repository::{link_or_copy_dir, SnapshotRepository};

use serde::{Deserialize, Serialize};

use crate::error::ReplicationError;

/// One file of a snapshot, named relative to the snapshot root
/// (`db_snapshot/<filename>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub path: String,
    pub data: Vec<u8>,
}

/// The set of files forming a consistent point-in-time image of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotArchive {
    pub files: Vec<SnapshotFile>,
}

impl SnapshotArchive {
    pub fn encode(&self) -> Result<Vec<u8>, ReplicationError> {
        flexbuffers::to_vec(self).map_err(|e| ReplicationError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ReplicationError> {
        flexbuffers::from_slice(bytes).map_err(|e| ReplicationError::Serialization(e.to_string()))
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|f| f.data.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_roundtrip() {
        let archive = SnapshotArchive {
            files: vec![
                SnapshotFile {
                    path: "db_snapshot/CURRENT".to_string(),
                    data: b"MANIFEST-000001\n".to_vec(),
                },
                SnapshotFile {
                    path: "db_snapshot/000004.sst".to_string(),
                    data: vec![0u8, 1, 2, 255],
                },
            ],
        };

        let bytes = archive.encode().unwrap();
        let decoded = SnapshotArchive::decode(&bytes).unwrap();
        assert_eq!(decoded.files.len(), 2);
        assert_eq!(decoded.files[1].data, vec![0u8, 1, 2, 255]);
        assert_eq!(decoded.total_bytes(), archive.total_bytes());
    }
}
