//! Health, status and administrative operations.

use actix_web::{web, HttpResponse};

use crate::app::AppState;

/// `GET /health`
pub async fn get_health(state: web::Data<AppState>) -> HttpResponse {
    if state.replication.is_alive() {
        HttpResponse::Ok().json(serde_json::json!({ "ok": true }))
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({ "ok": false }))
    }
}

/// `GET /status`
pub async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.replication.status())
}

/// `POST /operations/snapshot`: trigger a snapshot now.
pub async fn post_snapshot(state: web::Data<AppState>) -> HttpResponse {
    match state.replication.trigger_snapshot().await {
        Ok(()) => HttpResponse::Created().json(serde_json::json!({ "success": true })),
        Err(e) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}

/// `POST /operations/vote`: trigger a leader election now.
pub async fn post_vote(state: web::Data<AppState>) -> HttpResponse {
    match state.replication.trigger_election().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "success": true })),
        Err(e) => HttpResponse::InternalServerError()
            .json(serde_json::json!({ "success": false, "message": e.to_string() })),
    }
}

/// `POST /config`: update runtime-tunable settings.
pub async fn post_config(body: web::Bytes, state: web::Data<AppState>) -> HttpResponse {
    let update: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            return HttpResponse::BadRequest()
                .json(serde_json::json!({ "message": e.to_string() }))
        }
    };

    if let Some(threshold) = update
        .get("log_slow_requests_time_ms")
        .and_then(serde_json::Value::as_i64)
    {
        state.runtime_config.write().log_slow_requests_time_ms = threshold;
        log::info!("log_slow_requests_time_ms set to {}", threshold);
    }

    HttpResponse::Ok().json(serde_json::json!({ "success": true }))
}
