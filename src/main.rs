use anyhow::{Context, Result};
use dotenvy::dotenv;
use peernotez::{
    config::{Config, MAX_DB_CONNECTIONS},
    db_ops::{Document, COLLECTIONS},
    models::{AppState, User},
    routes, storage,
    store::postgres::PgStore,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let db = PgStore::connect(&config.database_url, MAX_DB_CONNECTIONS)
        .await
        .context("pool to be able to connect")?;
    db.ensure_collections(&COLLECTIONS).await?;
    db.ensure_unique(User::COLLECTION, "email").await?;

    let storage = storage::from_config(&config.storage)?;
    let addr = config.bind_addr;
    let state = AppState {
        db: Arc::new(db),
        storage,
        config: Arc::new(config),
    };
    let app = routes::app(state);

    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
