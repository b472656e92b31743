use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod bootstrap;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let boot = bootstrap::bootstrap_from_env().await?;
    let _maintenance = boot.maintenance.clone().spawn();

    let app = chatgate_router::public_router(boot.context.clone());

    let bind = format!("{}:{}", boot.config.host, boot.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
