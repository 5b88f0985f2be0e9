use crate::{
    backend::{RelationalSource, TimeSeriesSource},
    catalog::{tool_definitions, ToolDefinition},
    config::AppConfig,
    influx::InfluxSource,
    postgres::{self, PostgresSource},
    state::AppState,
    tools::{ToolDispatcher, ToolResponse},
};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

/// Body of `POST /api/tools/call`.
#[derive(Debug, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pool = postgres::connect_pool(&config).await?;
        let timeseries = InfluxSource::new(config.influx.clone(), config.request_timeout);
        info!(
            url = %config.influx.url,
            bucket = %config.influx.bucket,
            "InfluxDB source configured"
        );

        Ok(Self::with_backends(
            config,
            Arc::new(timeseries),
            Arc::new(PostgresSource::new(pool)),
        ))
    }

    /// Builds a server over caller-provided backends.
    pub fn with_backends(
        config: AppConfig,
        timeseries: Arc<dyn TimeSeriesSource>,
        relational: Arc<dyn RelationalSource>,
    ) -> Self {
        let config = Arc::new(config);
        let dispatcher = ToolDispatcher::new(Arc::clone(&config), timeseries, relational);
        let state = AppState::new(Arc::clone(&config), dispatcher);

        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/tools", get(Self::list_tools))
            .route("/api/tools/call", post(Self::call_tool))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "factory-tools listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn list_tools() -> Json<Value> {
        let tools: Vec<ToolDefinition> = tool_definitions();
        Json(json!({ "tools": tools }))
    }

    async fn call_tool(
        State(state): State<AppState>,
        Json(request): Json<ToolCallRequest>,
    ) -> Json<ToolResponse> {
        Json(state.dispatcher.call(&request.name, request.arguments).await)
    }
}
