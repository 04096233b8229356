use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

mod app;
mod auth;
mod cache;
mod config;
mod error;
mod extract;
mod health;
mod ratelimit;
mod state;
#[cfg(test)]
mod testing;
mod users;

use crate::{
    cache::{Cache, NoopCache, RedisCache},
    config::{AppConfig, LogConfig},
    state::AppState,
    users::repo::PgUserStore,
};

fn init_tracing(cfg: &LogConfig) {
    if cfg.json {
        tracing_subscriber::fmt()
            .with_env_filter(cfg.filter.as_str())
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(cfg.filter.as_str()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::from_env().context("load configuration")?);
    init_tracing(&config.log);
    tracing::info!(mode = ?config.server.mode, "configuration loaded");

    let db = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
        .max_lifetime(Duration::from_secs(config.database.max_lifetime_secs))
        .connect(&config.database.url)
        .await
        .context("connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .context("run database migrations")?;

    let cache: Arc<dyn Cache> = match RedisCache::connect(&config.redis).await {
        Ok(redis) => Arc::new(redis),
        Err(e) => {
            tracing::warn!(error = %e, "redis unavailable; running without cache");
            Arc::new(NoopCache)
        }
    };

    let state = AppState::from_parts(config.clone(), Arc::new(PgUserStore::new(db.clone())), cache)?;
    let sweeper = state.limiter.clone().map(ratelimit::spawn_sweeper);

    let app = app::build_app(state);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parse listen address")?;

    let served = app::serve(app, addr, config.shutdown_grace()).await;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    db.close().await;
    tracing::info!("server exiting");
    served
}
