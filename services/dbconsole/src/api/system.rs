//! System/health API handlers.
//!
//! # Purpose
//! A fast, side-effect free liveness endpoint. The console holds no database
//! credentials of its own, so health reports process state only.
use crate::api::types::HealthStatus;
use crate::app::AppState;
use axum::extract::State;
use axum::Json;

#[utoipa::path(
    get,
    path = "/v1/system/health",
    tag = "system",
    responses(
        (status = 200, description = "Console health", body = HealthStatus)
    )
)]
pub(crate) async fn system_health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        backend: state.backend_name.to_string(),
        sessions: state.coordinator.sessions().len(),
        transactions: state.coordinator.transactions().len(),
    })
}
