use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::gateway::events::validate_topic;
use crate::gateway::hub::PublishReport;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Compare digests rather than raw strings so the check does not leak the
/// key through early exit.
fn key_matches(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// `POST /api/v1/publish`: producer ingress into the hub.
pub async fn publish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Result<Json<PublishReport>, AppError> {
    let Some(expected) = state.config.publish_key.as_deref() else {
        return Err(AppError::NotFound("publishing is disabled".into()));
    };
    let presented = headers
        .get("X-Publish-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing publish key".into()))?;
    if !key_matches(presented, expected) {
        return Err(AppError::Forbidden("invalid publish key".into()));
    }

    validate_topic(&body.topic).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let report = state.hub.publish_with_report(&body.topic, body.data).await?;
    Ok(Json(report))
}
