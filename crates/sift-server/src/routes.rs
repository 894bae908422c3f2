//! Route tables: the actix route table and the replicated write router.
//!
//! Both must agree on patterns: the write router's patterns feed the
//! route hashes embedded in the log, and the actix table decides which
//! handler fields the request.

use actix_web::web;

use sift_raft::WriteRouter;

use crate::handlers::{collections, documents, operations, writes};

/// Register the HTTP route table.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(operations::get_health))
        .route("/status", web::get().to(operations::get_status))
        .route("/config", web::post().to(operations::post_config))
        .route(
            "/operations/snapshot",
            web::post().to(operations::post_snapshot),
        )
        .route("/operations/vote", web::post().to(operations::post_vote))
        .route(
            "/collections",
            web::post().to(collections::post_create_collection),
        )
        .route("/collections", web::get().to(collections::get_collections))
        .route(
            "/collections/{collection}",
            web::get().to(collections::get_collection_summary),
        )
        .route(
            "/collections/{collection}",
            web::delete().to(collections::del_drop_collection),
        )
        .route(
            "/collections/{collection}/documents",
            web::post().to(documents::post_add_document),
        )
        // NOTE: `import` must be registered before the `{id}` routes, which
        // would otherwise swallow it as a document id
        .route(
            "/collections/{collection}/documents/import",
            web::post().to(documents::post_import_documents),
        )
        .route(
            "/collections/{collection}/documents/{id}",
            web::get().to(documents::get_fetch_document),
        )
        .route(
            "/collections/{collection}/documents/{id}",
            web::patch().to(documents::patch_update_document),
        )
        .route(
            "/collections/{collection}/documents/{id}",
            web::delete().to(documents::del_remove_document),
        );
}

/// Build the write router the apply path dispatches through.
///
/// Patterns here are pinned by the route hashes stored in the log: renaming
/// one orphans every old entry that used it.
pub fn build_write_router() -> WriteRouter {
    let mut router = WriteRouter::new();

    router.register("POST", "/collections", writes::create_collection);
    router.register(
        "DELETE",
        "/collections/{collection}",
        writes::drop_collection,
    );
    router.register(
        "POST",
        "/collections/{collection}/documents",
        writes::add_document,
    );
    router.register(
        "POST",
        "/collections/{collection}/documents/import",
        writes::import_documents,
    );
    router.register(
        "PATCH",
        "/collections/{collection}/documents/{id}",
        writes::patch_document,
    );
    router.register(
        "DELETE",
        "/collections/{collection}/documents/{id}",
        writes::delete_document,
    );

    router
}
