//! registry_server — standalone REST server for the GIS registry engine.
//!
//! Reads config from env vars (a `.env` file is honoured):
//!   DATABASE_URL              — Postgres connection string
//!   REGISTRY_SCHEMA           — schema of the registry tables (default: register)
//!   REGISTRY_BIND_ADDR        — listen address (default: 0.0.0.0:4200)
//!   REGISTRY_FILE_STORE_DIR   — directory for attachments above the inline limit
//!
//! ```bash
//! DATABASE_URL=postgresql://localhost/gis cargo run --bin registry_server --features server
//! curl http://localhost:4200/api/health
//! ```

use gis_registry::api::create_registry_router;
use gis_registry::config::EngineConfig;
use gis_registry::database::mask_database_url;
use gis_registry::engine::RegistryEngine;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gis_registry=debug".into()),
        )
        .init();

    let config = EngineConfig::from_env();
    tracing::info!(
        "Starting registry server against {}",
        mask_database_url(&config.database.database_url)
    );

    let engine = RegistryEngine::connect(&config).await?;

    let app = create_registry_router(engine)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
