pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod flux;
pub mod influx;
pub mod models;
pub mod postgres;
pub mod server;
pub mod state;
pub mod statement;
pub mod stats;
pub mod telemetry;
pub mod time;
pub mod tools;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the factory tool service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
