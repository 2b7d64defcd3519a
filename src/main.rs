use anyhow::Context;
use parrotnest::{app, config::Config, db, identity::Identity, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let db_pool = db::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let identity = Identity::from_secret(
        config.jwt_secret.as_deref(),
        time::Duration::hours(config.token_ttl_hours),
    );
    let app_state = AppState::new(db_pool, identity, config.push_buffer);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app(app_state)).await?;
    Ok(())
}
