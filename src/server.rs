pub mod api;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{Method, header},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::storage::Store;
use api::AppState;

/// Build the query API router
pub fn router(store: Arc<Store>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any)
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(api::health))
        .route("/packs/{family}/{release}/{pack}", get(api::get_by_pack_name))
        .route(
            "/packs/{family}/{release}/{pack}/{arch}",
            get(api::get_by_pack_name),
        )
        .route("/cves/{family}/{release}/{id}", get(api::get_by_cve_id))
        .route(
            "/cves/{family}/{release}/{id}/{arch}",
            get(api::get_by_cve_id),
        )
        .route("/count/{family}/{release}", get(api::count_definitions))
        .route("/lastmodified/{family}/{release}", get(api::get_last_modified))
        .layer(cors)
        .with_state(AppState { store })
}

/// Serve the query API until ctrl-c.
pub async fn run(config: &Config, store: Arc<Store>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind, config.server_port)
        .parse()
        .with_context(|| {
            format!("Invalid bind address {}:{}", config.bind, config.server_port)
        })?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, backend = store.name(), "Server listening");

    axum::serve(listener, router(store.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Server shutting down");
        })
        .await
        .context("Server error")?;

    store.close().await;
    Ok(())
}
