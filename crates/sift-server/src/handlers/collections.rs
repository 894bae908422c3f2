//! Collection endpoints.

use actix_web::{web, HttpRequest, HttpResponse};

use crate::app::AppState;

use super::dispatch_write;

/// `GET /collections`
pub async fn get_collections(state: web::Data<AppState>) -> HttpResponse {
    let all = state.collections.list_collections();
    HttpResponse::Ok().json(all)
}

/// `GET /collections/{collection}`
pub async fn get_collection_summary(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> HttpResponse {
    match state.collections.get_collection(&path) {
        Some(meta) => HttpResponse::Ok().json(meta),
        None => HttpResponse::NotFound()
            .json(serde_json::json!({ "message": format!("Collection not found: {}", path) })),
    }
}

/// `POST /collections`
pub async fn post_create_collection(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    dispatch_write(&state, &req, body.to_vec()).await
}

/// `DELETE /collections/{collection}`
pub async fn del_drop_collection(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    dispatch_write(&state, &req, Vec::new()).await
}
