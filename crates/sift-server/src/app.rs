//! Shared application state.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sift_raft::{ReplicationState, WriteRouter};
use sift_store::{CollectionManager, Store};

/// Settings tunable at runtime through `POST /config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Log requests slower than this many milliseconds; negative disables.
    #[serde(default = "default_log_slow_requests_time_ms")]
    pub log_slow_requests_time_ms: i64,
}

fn default_log_slow_requests_time_ms() -> i64 {
    -1
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_slow_requests_time_ms: default_log_slow_requests_time_ms(),
        }
    }
}

/// Handles shared by every HTTP worker.
pub struct AppState {
    pub store: Arc<Store>,
    pub collections: Arc<CollectionManager>,
    pub replication: Arc<ReplicationState>,
    pub write_router: Arc<WriteRouter>,
    pub http_client: reqwest::Client,
    pub runtime_config: RwLock<RuntimeConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        collections: Arc<CollectionManager>,
        replication: Arc<ReplicationState>,
        write_router: Arc<WriteRouter>,
    ) -> Self {
        Self {
            store,
            collections,
            replication,
            write_router,
            http_client: reqwest::Client::new(),
            runtime_config: RwLock::new(RuntimeConfig::default()),
        }
    }
}
