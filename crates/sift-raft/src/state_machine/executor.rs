//! The worker side of the apply rendezvous.
//!
//! Committed entries are executed off the apply loop by the write executor,
//! one at a time: the applier posts an [`ApplyJob`] and blocks on its gate,
//! the executor runs the mutation through the [`WriteRouter`] and signals
//! completion. Mutations therefore land in log order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use sift_store::{CollectionManager, Store, StoreError};

use crate::codec::{ReplicatedRequest, StoredResponse, ROUTE_ALREADY_HANDLED};

/// Who owns response teardown after the gate fires.
#[derive(Debug)]
pub enum Teardown {
    /// The worker delivered (or disposed of) the response itself.
    FreedByWorker,
    /// The apply side delivers this response to the origin.
    FreedByApply(StoredResponse),
}

/// One committed entry handed to the executor, plus its one-shot gate.
pub struct ApplyJob {
    pub request: ReplicatedRequest,
    pub signal: oneshot::Sender<Teardown>,
}

/// Shared handles the mutation handlers run against.
#[derive(Clone)]
pub struct WriteContext {
    pub store: Arc<Store>,
    pub collections: Arc<CollectionManager>,
}

/// Path parameters extracted from a matched route.
pub type RouteParams = HashMap<String, String>;

/// A mutation handler. Handlers run only on the executor, so they see
/// mutations strictly in log order.
pub type RouteHandler =
    fn(&WriteContext, &RouteParams, &ReplicatedRequest) -> Result<StoredResponse, StoreError>;

enum Segment {
    Literal(String),
    Param(String),
}

/// A registered write route.
pub struct WriteRoute {
    pub method: String,
    pub pattern: String,
    pub hash: u64,
    segments: Vec<Segment>,
    handler: RouteHandler,
}

impl WriteRoute {
    fn extract_params(&self, path: &str) -> Option<RouteParams> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = RouteParams::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }
}

/// Route table for replicated mutations.
///
/// Routes are found by the stable hash embedded in the log entry, with a
/// plain path match as fallback; the reserved [`ROUTE_ALREADY_HANDLED`]
/// code never dispatches.
#[derive(Default)]
pub struct WriteRouter {
    routes: Vec<WriteRoute>,
}

impl WriteRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. `pattern` uses `{name}` placeholders, e.g.
    /// `/collections/{collection}/documents`.
    pub fn register(&mut self, method: &str, pattern: &str, handler: RouteHandler) {
        let segments = pattern
            .trim_matches('/')
            .split('/')
            .map(|part| {
                if part.starts_with('{') && part.ends_with('}') {
                    Segment::Param(part[1..part.len() - 1].to_string())
                } else {
                    Segment::Literal(part.to_string())
                }
            })
            .collect();

        self.routes.push(WriteRoute {
            method: method.to_string(),
            pattern: pattern.to_string(),
            hash: crate::codec::route_hash(method, pattern),
            segments,
            handler,
        });
    }

    /// Match an incoming request path, yielding the route and its params.
    pub fn match_route(&self, method: &str, path: &str) -> Option<(&WriteRoute, RouteParams)> {
        self.routes
            .iter()
            .filter(|r| r.method == method)
            .find_map(|r| r.extract_params(path).map(|params| (r, params)))
    }

    fn find_by_hash(&self, hash: u64) -> Option<&WriteRoute> {
        self.routes.iter().find(|r| r.hash == hash)
    }

    /// Execute the mutation a log entry describes.
    pub fn dispatch(&self, ctx: &WriteContext, request: &ReplicatedRequest) -> StoredResponse {
        let matched = self
            .find_by_hash(request.route_hash)
            .and_then(|route| {
                route
                    .extract_params(&request.path)
                    .map(|params| (route, params))
            })
            .or_else(|| self.match_route(&request.method, &request.path));

        let (route, params) = match matched {
            Some(found) => found,
            None => {
                log::error!(
                    "No write route for {} {} (hash {})",
                    request.method,
                    request.path,
                    request.route_hash
                );
                return StoredResponse::not_found("Not Found");
            }
        };

        match (route.handler)(ctx, &params, request) {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }
}

/// Map a store error onto the HTTP response surfaced to the client.
pub fn error_response(err: &StoreError) -> StoredResponse {
    let status = match err {
        StoreError::CollectionNotFound(_) | StoreError::DocumentNotFound(_) => 404,
        StoreError::CollectionExists(_) => 409,
        StoreError::InvalidDocument(_) => 400,
        _ => 500,
    };
    StoredResponse::json(status, &serde_json::json!({ "message": err.to_string() }))
}

/// The detached task draining apply jobs.
pub struct WriteExecutor;

impl WriteExecutor {
    pub fn spawn(
        ctx: WriteContext,
        router: Arc<WriteRouter>,
        mut jobs: mpsc::Receiver<ApplyJob>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                let teardown = if job.request.route_hash == ROUTE_ALREADY_HANDLED {
                    // response was populated upstream; nothing to re-run
                    Teardown::FreedByWorker
                } else {
                    Teardown::FreedByApply(router.dispatch(&ctx, &job.request))
                };

                if job.signal.send(teardown).is_err() {
                    log::warn!(
                        "Apply loop gave up on write {} {} before completion",
                        job.request.method,
                        job.request.path
                    );
                }
            }
            log::info!("Write executor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::route_hash;
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir) -> WriteContext {
        let store = Arc::new(Store::new(dir.path().join("state")));
        store.open().unwrap();
        let collections = Arc::new(CollectionManager::new(store.clone()));
        WriteContext { store, collections }
    }

    fn create_collection(
        ctx: &WriteContext,
        _params: &RouteParams,
        request: &ReplicatedRequest,
    ) -> Result<StoredResponse, StoreError> {
        let body: serde_json::Value = serde_json::from_slice(&request.body)
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))?;
        let name = body["name"].as_str().unwrap_or_default();
        let meta = ctx.collections.create_collection(name, 0)?;
        Ok(StoredResponse::json(201, &serde_json::json!({ "name": meta.name })))
    }

    fn drop_collection(
        ctx: &WriteContext,
        params: &RouteParams,
        _request: &ReplicatedRequest,
    ) -> Result<StoredResponse, StoreError> {
        let meta = ctx.collections.drop_collection(&params["collection"])?;
        Ok(StoredResponse::json(200, &serde_json::json!({ "name": meta.name })))
    }

    fn router() -> WriteRouter {
        let mut router = WriteRouter::new();
        router.register("POST", "/collections", create_collection);
        router.register("DELETE", "/collections/{collection}", drop_collection);
        router
    }

    fn request(method: &str, path: &str, pattern: &str, body: &[u8]) -> ReplicatedRequest {
        ReplicatedRequest::new(
            method,
            path,
            "",
            vec![],
            body.to_vec(),
            route_hash(method, pattern),
            "req-1",
        )
    }

    #[test]
    fn dispatch_by_hash_extracts_params() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let router = router();

        let create = request("POST", "/collections", "/collections", br#"{"name":"c"}"#);
        assert_eq!(router.dispatch(&ctx, &create).status_code, 201);

        let drop = request(
            "DELETE",
            "/collections/c",
            "/collections/{collection}",
            b"",
        );
        assert_eq!(router.dispatch(&ctx, &drop).status_code, 200);
        assert!(ctx.collections.get_collection("c").is_none());
    }

    #[test]
    fn dispatch_falls_back_to_path_match_on_unknown_hash() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let router = router();

        let mut create = request("POST", "/collections", "/collections", br#"{"name":"c"}"#);
        create.route_hash = 0xDEAD_BEEF; // hash from a route this build no longer has
        assert_eq!(router.dispatch(&ctx, &create).status_code, 201);
    }

    #[test]
    fn unknown_route_is_not_found() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let router = router();

        let bogus = request("PUT", "/nowhere", "/nowhere", b"");
        assert_eq!(router.dispatch(&ctx, &bogus).status_code, 404);
    }

    #[test]
    fn store_errors_map_to_statuses() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let router = router();

        let create = request("POST", "/collections", "/collections", br#"{"name":"c"}"#);
        router.dispatch(&ctx, &create);
        // duplicate name -> conflict
        assert_eq!(router.dispatch(&ctx, &create).status_code, 409);

        let drop = request(
            "DELETE",
            "/collections/missing",
            "/collections/{collection}",
            b"",
        );
        assert_eq!(router.dispatch(&ctx, &drop).status_code, 404);
    }

    #[tokio::test]
    async fn executor_signals_gate_in_order() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let (tx, rx) = mpsc::channel(8);
        let handle = WriteExecutor::spawn(ctx, Arc::new(router()), rx);

        let (gate_tx, gate_rx) = oneshot::channel();
        tx.send(ApplyJob {
            request: request("POST", "/collections", "/collections", br#"{"name":"c"}"#),
            signal: gate_tx,
        })
        .await
        .unwrap();

        match gate_rx.await.unwrap() {
            Teardown::FreedByApply(response) => assert_eq!(response.status_code, 201),
            Teardown::FreedByWorker => panic!("worker should hand the response back"),
        }

        // reserved code: never re-run, worker keeps teardown
        let (gate_tx, gate_rx) = oneshot::channel();
        let mut handled = request("POST", "/collections", "/collections", b"");
        handled.route_hash = ROUTE_ALREADY_HANDLED;
        tx.send(ApplyJob {
            request: handled,
            signal: gate_tx,
        })
        .await
        .unwrap();
        assert!(matches!(gate_rx.await.unwrap(), Teardown::FreedByWorker));

        drop(tx);
        handle.await.unwrap();
    }
}
