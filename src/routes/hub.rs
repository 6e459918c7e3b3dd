use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::gateway::hub::{HubStats, TopicSummary};
use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub async fn stats(
    _user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<HubStats>, AppError> {
    Ok(Json(state.hub.stats().await?))
}

pub async fn topics(
    _user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<TopicSummary>>, AppError> {
    Ok(Json(state.hub.topics().await?))
}
