use std::net::SocketAddr;

use anyhow::Context;
use redwave_agent::{InstanceManager, PanelConfig, http};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = PanelConfig::load()?;
    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.listen))?;

    let manager = InstanceManager::new(&config);
    let app = http::router(manager);

    tracing::info!(
        %addr,
        data_root = %config.data_root.display(),
        templates = config.templates.len(),
        "redwave-agent HTTP listening"
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}
