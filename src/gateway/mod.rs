/// HTTP surface of the broker: the streaming query endpoint, the
/// local-agent polling endpoints, and the source connection test.
pub mod agents;
pub mod query;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::broker::LocalAgentBroker;
use crate::catalog::ToolCatalog;
use crate::config::{BrokerConfig, ProvidersConfig, ServerConfig};
use crate::executor::ToolExecutor;
use crate::mcp::McpClient;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub broker: Arc<LocalAgentBroker>,
    pub catalog: Arc<ToolCatalog>,
    pub executor: Arc<ToolExecutor>,
    pub mcp: McpClient,
    pub providers: ProvidersConfig,
    pub broker_config: BrokerConfig,
}

impl AppState {
    pub fn new(pool: SqlitePool, providers: ProvidersConfig, broker_config: BrokerConfig) -> Self {
        let broker = Arc::new(LocalAgentBroker::new());
        let mcp = McpClient::new();
        let catalog = Arc::new(ToolCatalog::new(pool.clone(), mcp.clone(), broker.clone()));
        let executor = Arc::new(ToolExecutor::new(broker.clone(), mcp.clone()));
        Self {
            pool,
            broker,
            catalog,
            executor,
            mcp,
            providers,
            broker_config,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(query::query_handler))
        .route("/agents/register", post(agents::register))
        .route("/agents/poll/{agent_id}", post(agents::poll))
        .route("/agents/results/{task_id}", post(agents::submit_result))
        .route("/agents/refresh-tools", post(agents::refresh_tools))
        .route("/agents/status", get(agents::status))
        .route("/agents/execute", post(agents::execute))
        .route("/sources/test-connection", post(agents::test_connection))
        .with_state(state)
}

/// Bind and serve, with a background task sweeping stale agents.
pub async fn serve(server: &ServerConfig, state: AppState) -> Result<()> {
    let reap_interval = Duration::from_secs(state.broker_config.reap_interval_seconds);
    let staleness = Duration::from_secs(state.broker_config.agent_staleness_minutes * 60);
    let broker = state.broker.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_interval);
        loop {
            ticker.tick().await;
            broker.reap(staleness);
        }
    });

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {}", addr);

    axum::serve(listener, build_router(state))
        .await
        .context("server error")?;
    Ok(())
}
