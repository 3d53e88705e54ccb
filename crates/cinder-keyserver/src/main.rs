use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use cinder_keyserver::config::{self, StorageBackend};
use cinder_keyserver::store::sqlite::SqliteStore;
use cinder_keyserver::{http, KeyServer, ServerError};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "cinder-keyserver failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let args = config::parse_args(std::env::args().skip(1), |key| std::env::var(key).ok())?;
    tracing::info!("cinder-keyserver starting");

    let server = match &args.storage {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, nothing survives a restart");
            KeyServer::in_memory(args.server)
        }
        StorageBackend::Sqlite(path) => {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            KeyServer::new(Arc::new(SqliteStore::open(path)?), args.server)
        }
    };

    let app = http::router(Arc::new(server));
    let listener = tokio::net::TcpListener::bind(args.listen).await?;

    tracing::info!(
        listen = %args.listen,
        bundle_prekeys = args.server.bundle_prekey_limit,
        "cinder-keyserver ready"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("cinder-keyserver stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
