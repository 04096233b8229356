use axum::{extract::State, Json};
use serde::Serialize;
use tracing::warn;

use crate::state::AppState;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db: &'static str,
}

/// Always 200; a failed store ping only downgrades the status.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let response = match state.store.ping().await {
        Ok(()) => HealthResponse {
            status: "up",
            db: "up",
        },
        Err(e) => {
            warn!(error = %e, "database ping failed");
            HealthResponse {
                status: "degraded",
                db: "down",
            }
        }
    };
    Json(response)
}
