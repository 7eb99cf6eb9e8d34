//! # Sphere Server
//!
//! SocialSphere HTTP API and realtime gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Secrets are required
//! SPHERE_AUTH__ACCESS_TOKEN_SECRET=... SPHERE_AUTH__REFRESH_TOKEN_SECRET=... sphere
//!
//! # Or put them in ./sphere.toml
//! sphere
//!
//! # Run from one explicit file, skipping the search path and environment
//! sphere /srv/sphere/sphere.toml
//!
//! # Override anything from the environment
//! SPHERE_PORT=8080 SPHERE_HOST=0.0.0.0 sphere
//! ```

mod api;
mod config;
mod error;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sphere=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = config::Config::from_file(&path)?;
            config.validate()?;
            config
        }
        None => config::Config::load()?,
    };

    tracing::info!("Starting Sphere server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
