use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::guard::lockdown::UnlockReport;
use crate::guard::{GuardEngine, GuildStatus};

pub fn router(engine: Arc<GuardEngine>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/guilds/{guild_id}/status", get(guild_status))
        .route("/guilds/{guild_id}/unlock", post(guild_unlock))
        .with_state(engine)
}

/// HTTP: healthcheck + stan ochrony gildii.
pub async fn serve(addr: SocketAddr, engine: Arc<GuardEngine>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status api listening");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

async fn guild_status(
    State(engine): State<Arc<GuardEngine>>,
    Path(guild_id): Path<u64>,
) -> Json<GuildStatus> {
    Json(engine.status(guild_id).await)
}

async fn guild_unlock(
    State(engine): State<Arc<GuardEngine>>,
    Path(guild_id): Path<u64>,
) -> Json<Option<UnlockReport>> {
    Json(engine.unlock(guild_id).await)
}
