use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use minirag_rag::{open_session, AppConfig};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = AppConfig::load()?;
    let session = {
        let config = config.clone();
        // Blocking http clients must be built off the async workers.
        tokio::task::spawn_blocking(move || open_session(&config)).await??
    };
    info!(
        db = %config.db_path.display(),
        index_dir = %config.index_dir.display(),
        provider = config.provider.as_str(),
        model = %config.model,
        "session ready"
    );
    let app = minirag_service::router(Arc::new(session));
    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}
