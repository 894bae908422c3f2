//! HTTP API tests against a node whose consensus layer is not started:
//! reads are served locally, writes are rejected for want of a leader, and
//! the admin endpoints report truthfully.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use actix_web::{test, web, App};
use tempfile::TempDir;

use sift_raft::{ReplicationOptions, ReplicationState};
use sift_server::app::AppState;
use sift_server::routes;
use sift_store::{CollectionManager, Store};

fn app_state(dir: &TempDir) -> web::Data<AppState> {
    let store = Arc::new(Store::new(dir.path().join("state")));
    store.open().unwrap();
    let collections = Arc::new(CollectionManager::new(store.clone()));
    let write_router = Arc::new(routes::build_write_router());

    let options = ReplicationOptions {
        peering_host: "127.0.0.1".to_string(),
        peering_port: 7100,
        api_port: 8108,
        election_timeout_ms: 300,
        snapshot_interval_s: 0,
        apply_timeout_ms: 1000,
        raft_dir: dir.path().join("raft"),
        nodes: String::new(),
        create_init_db_snapshot: false,
    };

    let replication = ReplicationState::new(
        store.clone(),
        collections.clone(),
        write_router.clone(),
        options,
        Arc::new(AtomicBool::new(false)),
    );

    web::Data::new(AppState::new(store, collections, replication, write_router))
}

macro_rules! service {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data($state.clone())
                .configure(routes::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn health_is_unavailable_before_init() {
    let dir = TempDir::new().unwrap();
    let state = app_state(&dir);
    let app = service!(state);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), 503);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["ok"], false);
}

#[actix_web::test]
async fn status_reports_absent_node() {
    let dir = TempDir::new().unwrap();
    let state = app_state(&dir);
    let app = service!(state);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/status").to_request()).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["state"], 0);
    assert_eq!(body["committed_index"], 0);
    assert_eq!(body["queued_writes"], 0);
}

#[actix_web::test]
async fn reads_are_served_from_the_local_store() {
    let dir = TempDir::new().unwrap();
    let state = app_state(&dir);

    state.collections.create_collection("books", 1).unwrap();
    state
        .collections
        .upsert_document("books", serde_json::json!({"id": "1", "title": "Dune"}), "fb")
        .unwrap();

    let app = service!(state);

    let resp =
        test::call_service(&app, test::TestRequest::get().uri("/collections").to_request()).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body[0]["name"], "books");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/collections/books/documents/1")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["title"], "Dune");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/collections/books/documents/404")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/collections/nope").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn writes_without_a_leader_are_rejected() {
    let dir = TempDir::new().unwrap();
    let state = app_state(&dir);
    let app = service!(state);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/collections")
            .set_payload(r#"{"name":"c"}"#)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 500);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["message"], "Could not find a leader.");
}

#[actix_web::test]
async fn config_endpoint_updates_runtime_settings() {
    let dir = TempDir::new().unwrap();
    let state = app_state(&dir);
    let app = service!(state);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/config")
            .set_payload(r#"{"log_slow_requests_time_ms": 2000}"#)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(state.runtime_config.read().log_slow_requests_time_ms, 2000);
}
