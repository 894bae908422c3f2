//! Replicated mutation handlers.
//!
//! These run on the write executor, on every node of the cluster, strictly
//! in log order. They must be deterministic: anything time- or
//! randomness-dependent (timestamps, generated ids) comes out of the
//! replicated request, never out of the local environment.

use serde_json::Value;

use sift_raft::state_machine::{RouteParams, WriteContext};
use sift_raft::{ReplicatedRequest, StoredResponse};
use sift_store::StoreError;

use super::REQUEST_TIME_HEADER;

type HandlerResult = Result<StoredResponse, StoreError>;

/// Submit-time wall clock captured on the leader; zero when absent.
fn request_time(request: &ReplicatedRequest) -> u64 {
    request
        .header(REQUEST_TIME_HEADER)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn param<'a>(params: &'a RouteParams, name: &str) -> &'a str {
    params.get(name).map(String::as_str).unwrap_or_default()
}

fn json_body(request: &ReplicatedRequest) -> Result<Value, StoreError> {
    serde_json::from_slice(&request.body).map_err(|e| StoreError::InvalidDocument(e.to_string()))
}

pub fn create_collection(
    ctx: &WriteContext,
    _params: &RouteParams,
    request: &ReplicatedRequest,
) -> HandlerResult {
    let body = json_body(request)?;
    let name = body
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidDocument("'name' is required".to_string()))?;

    let meta = ctx.collections.create_collection(name, request_time(request))?;
    Ok(StoredResponse::json(
        201,
        &serde_json::to_value(&meta).unwrap_or_default(),
    ))
}

pub fn drop_collection(
    ctx: &WriteContext,
    params: &RouteParams,
    _request: &ReplicatedRequest,
) -> HandlerResult {
    let meta = ctx.collections.drop_collection(param(params, "collection"))?;
    Ok(StoredResponse::json(
        200,
        &serde_json::to_value(&meta).unwrap_or_default(),
    ))
}

pub fn add_document(
    ctx: &WriteContext,
    params: &RouteParams,
    request: &ReplicatedRequest,
) -> HandlerResult {
    let document = json_body(request)?;
    let stored = ctx.collections.upsert_document(
        param(params, "collection"),
        document,
        &request.request_id,
    )?;
    Ok(StoredResponse::json(201, &stored))
}

pub fn import_documents(
    ctx: &WriteContext,
    params: &RouteParams,
    request: &ReplicatedRequest,
) -> HandlerResult {
    let report = ctx.collections.import_documents(
        param(params, "collection"),
        &request.body,
        &request.request_id,
    )?;

    // one JSON result per input line, like the per-line input format
    let lines: Vec<String> = report
        .results
        .iter()
        .map(|result| result.to_string())
        .collect();

    Ok(StoredResponse::new(
        200,
        "text/plain; charset=utf-8",
        lines.join("\n").into_bytes(),
    ))
}

pub fn patch_document(
    ctx: &WriteContext,
    params: &RouteParams,
    request: &ReplicatedRequest,
) -> HandlerResult {
    let patch = json_body(request)?;
    let updated = ctx.collections.patch_document(
        param(params, "collection"),
        param(params, "id"),
        patch,
    )?;
    Ok(StoredResponse::json(200, &updated))
}

pub fn delete_document(
    ctx: &WriteContext,
    params: &RouteParams,
    _request: &ReplicatedRequest,
) -> HandlerResult {
    let deleted = ctx
        .collections
        .delete_document(param(params, "collection"), param(params, "id"))?;
    Ok(StoredResponse::json(200, &deleted))
}
