//! HTTP handlers.
//!
//! Reads are served from the local store. Mutations are turned into
//! [`ReplicatedRequest`]s and submitted to the replication layer on the
//! leader, or relayed to the leader from a follower.

pub mod collections;
pub mod documents;
pub mod operations;
pub mod writes;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};

use sift_raft::{ReplicatedRequest, ReplicationError, StoredResponse};

use crate::app::AppState;
use crate::forward;

/// Header carrying the submit-time wall clock, captured once on the leader
/// and replicated in the log so timestamps are identical on every replica.
pub const REQUEST_TIME_HEADER: &str = "x-sift-request-time";

/// Headers worth replicating: routing- and auth-relevant only.
const REPLICATED_HEADERS: [&str; 3] = ["content-type", "authorization", "x-sift-api-key"];

/// Turn an incoming mutation into a log entry (leader) or relay it to the
/// leader (follower). Exactly one response reaches the client either way.
pub async fn dispatch_write(
    state: &web::Data<AppState>,
    req: &HttpRequest,
    body: Vec<u8>,
) -> HttpResponse {
    let method = req.method().as_str().to_string();
    let path = req.path().to_string();

    let route_hash = match state.write_router.match_route(&method, &path) {
        Some((route, _)) => route.hash,
        None => {
            return HttpResponse::NotFound().json(serde_json::json!({ "message": "Not Found" }))
        }
    };

    if !state.replication.is_leader() {
        return forward::follower_relay(state, req, body).await;
    }

    let mut headers: Vec<(String, String)> = REPLICATED_HEADERS
        .iter()
        .filter_map(|name| {
            req.headers()
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    headers.push((REQUEST_TIME_HEADER.to_string(), now.to_string()));

    let request = ReplicatedRequest::new(
        method,
        path,
        req.query_string(),
        headers,
        body,
        route_hash,
        uuid::Uuid::new_v4().to_string(),
    );

    match state.replication.write(request).await {
        Ok(response) => stored_to_http(response),
        Err(e) => replication_error_to_http(&e),
    }
}

/// Convert a handler response into the actix response sent to the client.
pub fn stored_to_http(response: StoredResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status_code)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = HttpResponse::build(status);
    if !response.content_type.is_empty() {
        builder.content_type(response.content_type.clone());
    }
    builder.body(response.body)
}

pub fn replication_error_to_http(err: &ReplicationError) -> HttpResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(serde_json::json!({ "message": err.to_string() }))
}
