#[tokio::main]
async fn main() -> anyhow::Result<()> {
    postrelay_observability::init();

    let config = postrelay_api::app::AppConfig {
        database_url: std::env::var("DATABASE_URL").ok(),
        ..Default::default()
    };

    let parts = postrelay_api::app::build_app(config).await?;

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, parts.router).await?;

    parts.sweeper.shutdown().await;
    Ok(())
}
