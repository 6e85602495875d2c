mod ai;
mod config;
mod error;
mod hub;
mod protocol;
mod routes;
mod state;
mod utils {
    pub mod clean;
    pub mod ids;
}

use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, Extension, Router};
use tower_http::{limit::RequestBodyLimitLayer, services::ServeDir};
use tracing::info;

use crate::{ai::AiClient, config::Config, hub::Hub, utils::clean};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = Arc::new(Config::from_environment()?);
    tracing_subscriber::fmt().with_max_level(cfg.log_level).init();

    let hub = Arc::new(Hub::new(cfg.clone()));
    let ai = Arc::new(AiClient::new(&cfg)?);
    match cfg.gemini_key.as_deref() {
        Some(key) => info!(key = %config::mask_key(key), model = %cfg.gemini_model, "ai backend enabled"),
        None => info!("no GEMINI_API_KEY/API_KEY set, ai backend needs a per-request key"),
    }

    tokio::spawn(clean::task(hub.clone(), cfg.reaper_interval)); // room reaper

    let app = Router::new()
        .merge(routes::router())
        .fallback_service(ServeDir::new(&cfg.static_dir))
        .layer(Extension(hub))
        .layer(Extension(ai))
        .layer(DefaultBodyLimit::max(cfg.body_limit))
        .layer(RequestBodyLimitLayer::new(cfg.body_limit));

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr()).await?;
    info!(addr = %cfg.bind_addr(), grace = ?cfg.grace_period, "canvas hub listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
