//! In-flight leader writes.
//!
//! Each `write` submission registers a [`PendingWrite`] keyed by request id.
//! The apply path takes it back out to deliver the response; a failed
//! submission takes it out to deliver the error. Whoever removes the entry
//! owns delivery, so every write resolves exactly once.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::StoredResponse;
use crate::error::ReplicationError;

/// Completion side of one in-flight leader write.
pub struct PendingWrite {
    /// Channel back to the HTTP worker awaiting this write.
    pub responder: oneshot::Sender<Result<StoredResponse, ReplicationError>>,
    /// Leader term captured at submit time; reported back to the waiter
    /// when leadership changes before the entry commits.
    pub expected_term: u64,
}

/// Where a committed entry originated.
pub enum ApplyOrigin {
    /// This node accepted the write; the waiter is still parked.
    Local(PendingWrite),
    /// Replicated from a peer (or the waiter is already gone).
    Remote,
}

/// Table of in-flight writes, keyed by request id.
#[derive(Default)]
pub struct PendingWrites {
    inner: Mutex<HashMap<String, PendingWrite>>,
}

impl PendingWrites {
    pub fn register(&self, request_id: String, write: PendingWrite) {
        let mut inner = self.inner.lock();
        if inner.insert(request_id.clone(), write).is_some() {
            log::warn!("Replaced in-flight write with duplicate id {}", request_id);
        }
    }

    pub fn take(&self, request_id: &str) -> Option<PendingWrite> {
        self.inner.lock().remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Fail every in-flight write. Used at shutdown so no waiter parks
    /// forever.
    pub fn fail_all(&self) {
        let drained: Vec<(String, PendingWrite)> = self.inner.lock().drain().collect();
        for (request_id, write) in drained {
            log::warn!("Failing in-flight write {} on shutdown", request_id);
            let _ = write.responder.send(Err(ReplicationError::Shutdown));
        }
    }
}
