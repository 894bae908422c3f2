//! Document endpoints.

use actix_web::{web, HttpRequest, HttpResponse};
use futures::StreamExt;

use crate::app::AppState;
use crate::forward;

use super::dispatch_write;

/// `GET /collections/{collection}/documents/{id}`
pub async fn get_fetch_document(
    path: web::Path<(String, String)>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let (collection, id) = path.into_inner();
    match state.collections.get_document(&collection, &id) {
        Ok(document) => HttpResponse::Ok().json(document),
        Err(e) => HttpResponse::NotFound().json(serde_json::json!({ "message": e.to_string() })),
    }
}

/// `POST /collections/{collection}/documents`
pub async fn post_add_document(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    dispatch_write(&state, &req, body.to_vec()).await
}

/// `PATCH /collections/{collection}/documents/{id}`
pub async fn patch_update_document(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    dispatch_write(&state, &req, body.to_vec()).await
}

/// `DELETE /collections/{collection}/documents/{id}`
pub async fn del_remove_document(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    dispatch_write(&state, &req, Vec::new()).await
}

/// `POST /collections/{collection}/documents/import`
///
/// On a follower the body is streamed to the leader chunk by chunk; a bulk
/// import must never be buffered whole on the relaying node. On the leader
/// the full body becomes one log entry.
pub async fn post_import_documents(
    req: HttpRequest,
    mut payload: web::Payload,
    state: web::Data<AppState>,
) -> HttpResponse {
    if !state.replication.is_leader() {
        return forward::relay_import_streaming(&state, &req, payload).await;
    }

    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(chunk) => body.extend_from_slice(&chunk),
            Err(e) => {
                return HttpResponse::BadRequest()
                    .json(serde_json::json!({ "message": e.to_string() }))
            }
        }
    }

    dispatch_write(&state, &req, body.to_vec()).await
}
