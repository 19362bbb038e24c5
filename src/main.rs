use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio::net::TcpListener;

use crate::cookies::{CookieStore, MemoryCookieStore};
use crate::forwarder::Forwarder;
use crate::server::ProxyApi;

mod config;
mod cookies;
mod error;
mod forwarder;
mod headers;
mod rewrite;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config::load_from_env()?;
    info!(
        "Configuration loaded: mount path {}, default session {:?}, upstream timeout {}s",
        config.mount_path, config.default_session, config.upstream.timeout_secs
    );

    // Jars live for the whole process and are shared by every request.
    let cookies: Arc<dyn CookieStore> = Arc::new(MemoryCookieStore::new());
    let forwarder = Forwarder::new(&config, Arc::clone(&cookies))?;
    info!("Outbound User-Agent: {}", forwarder.user_agent());

    let app = ProxyApi::new(config.clone(), forwarder, cookies).create_router();

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Proxy listening on http://{}{}", listener.local_addr()?, config.mount_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
