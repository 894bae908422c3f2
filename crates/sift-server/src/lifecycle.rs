//! Process lifecycle: bootstrap, run, graceful shutdown.
//!
//! Bootstrapping wires the store, the write router and the replication
//! layer together, starts the peering RPC server and the background loops
//! (membership refresh, init snapshot), and installs the panic hook that
//! persists the in-flight applying index on a crash.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use log::info;

use sift_commons::ServerConfig;
use sift_raft::network::start_rpc_server;
use sift_raft::{ReplicationOptions, ReplicationState};
use sift_store::{CollectionManager, Store};

use crate::app::AppState;
use crate::routes;

/// Process-wide handle for the crash hook; set during bootstrap.
static CRASH_HOOK_COLLECTIONS: OnceLock<Arc<CollectionManager>> = OnceLock::new();

/// Everything `run` needs that `bootstrap` produced.
pub struct ApplicationComponents {
    pub app_state: web::Data<AppState>,
    pub replication: Arc<ReplicationState>,
    pub store: Arc<Store>,
    pub shutting_down: Arc<AtomicBool>,
}

/// Initialize the store, replication layer and background services.
pub async fn bootstrap(config: &ServerConfig) -> Result<ApplicationComponents> {
    let store = Arc::new(Store::new(PathBuf::from(&config.storage.data_dir)));
    let collections = Arc::new(CollectionManager::new(store.clone()));
    let write_router = Arc::new(routes::build_write_router());
    let shutting_down = Arc::new(AtomicBool::new(false));

    install_crash_hook(collections.clone());

    let options = ReplicationOptions {
        peering_host: config.peering.host.clone(),
        peering_port: config.peering.port,
        api_port: config.api.port,
        election_timeout_ms: config.raft.election_timeout_ms,
        snapshot_interval_s: config.raft.snapshot_interval_s,
        apply_timeout_ms: config.raft.apply_timeout_ms,
        raft_dir: PathBuf::from(&config.storage.raft_dir),
        nodes: config.initial_nodes(),
        create_init_db_snapshot: config.cluster.create_init_db_snapshot,
    };

    let replication = ReplicationState::new(
        store.clone(),
        collections.clone(),
        write_router.clone(),
        options,
        shutting_down.clone(),
    );

    replication
        .start()
        .await
        .context("Failed to start replication")?;
    info!("Replication started (node id {})", replication.node_id());

    let rpc_addr: SocketAddr = format!("0.0.0.0:{}", config.peering.port)
        .parse()
        .context("Invalid peering address")?;
    start_rpc_server(replication.clone(), rpc_addr);

    if config.cluster.create_init_db_snapshot {
        spawn_init_snapshot(replication.clone());
    }

    if let Some(nodes_file) = config.cluster.nodes_file.clone() {
        spawn_nodes_refresh(
            replication.clone(),
            nodes_file,
            config.raft.refresh_nodes_interval_s,
            shutting_down.clone(),
        );
    }

    let app_state = web::Data::new(AppState::new(
        store.clone(),
        collections,
        replication.clone(),
        write_router,
    ));

    Ok(ApplicationComponents {
        app_state,
        replication,
        store,
        shutting_down,
    })
}

/// Run the HTTP server until a termination signal arrives, then shut the
/// stack down in order: HTTP, consensus, store.
pub async fn run(config: &ServerConfig, components: ApplicationComponents) -> Result<()> {
    let bind_addr = format!("{}:{}", config.api.host, config.api.port);
    info!("Starting API server on {}", bind_addr);

    let app_state = components.app_state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind(&bind_addr)?
    .workers(if config.api.workers == 0 {
        num_cpus::get()
    } else {
        config.api.workers
    })
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            if let Err(e) = result {
                log::error!("Server task failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received termination signal, initiating graceful shutdown...");

            // observed by the apply loop, which rolls back instead of
            // acknowledging further entries
            components.shutting_down.store(true, Ordering::SeqCst);

            server_handle.stop(true).await;
            components.replication.shutdown().await;
            components.store.close();
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Persist the in-flight applying index when the process dies mid-apply,
/// so the next boot resumes indexing from a safe point.
fn install_crash_hook(collections: Arc<CollectionManager>) {
    let _ = CRASH_HOOK_COLLECTIONS.set(collections);

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        if let Some(collections) = CRASH_HOOK_COLLECTIONS.get() {
            collections.persist_applying_index();
        }
        log::error!("siftd is terminating abruptly.");
        default_hook(panic_info);
    }));
}

/// Upgrade path for a stand-alone store: once a leader exists, append the
/// snapshot sentinel so the store gets its first replicated snapshot.
fn spawn_init_snapshot(replication: Arc<ReplicationState>) {
    tokio::spawn(async move {
        if !replication.wait_for_leader(Duration::from_secs(60)).await {
            log::error!("No leader elected; skipping init snapshot");
            return;
        }

        match replication.submit_init_snapshot().await {
            Ok(()) => info!("Init snapshot entry submitted"),
            Err(e) => log::error!("Failed to submit init snapshot entry: {}", e),
        }
    });
}

/// Re-read the nodes file periodically and refresh cluster membership so
/// an operator can rotate members (or recover a renumbered single node)
/// without restarting.
fn spawn_nodes_refresh(
    replication: Arc<ReplicationState>,
    nodes_file: String,
    interval_s: u64,
    shutting_down: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
        ticker.tick().await; // immediate first tick

        loop {
            ticker.tick().await;
            if shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let contents = match std::fs::read_to_string(&nodes_file) {
                Ok(contents) => contents,
                Err(e) => {
                    log::warn!("Failed to read nodes file {}: {}", nodes_file, e);
                    continue;
                }
            };

            if let Err(e) = replication.refresh_nodes(contents.trim()).await {
                log::warn!("refresh_nodes failed: {}", e);
            }
        }
    });
}
