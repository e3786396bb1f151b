//! Access listing handlers.
use crate::api::error::ApiError;
use crate::api::types::{AccessResponse, ErrorResponse};
use crate::api::{run, Authenticated};
use crate::app::AppState;
use axum::extract::State;
use axum::Json;

#[utoipa::path(
    get,
    path = "/v1/access",
    tag = "access",
    responses(
        (status = 200, description = "Databases, schemas and tables visible to the role", body = AccessResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse)
    )
)]
pub(crate) async fn list_access(
    State(state): State<AppState>,
    ctx: Authenticated,
) -> Result<Json<AccessResponse>, ApiError> {
    let active = ctx.active;
    let access = run(&state, &ctx.request_id, move |coordinator, cancel| async move {
        coordinator.list_access(&active, &cancel).await
    })
    .await?;
    Ok(Json(AccessResponse {
        access: access.as_ref().clone(),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/access/refresh",
    tag = "access",
    responses(
        (status = 200, description = "Freshly probed access view", body = AccessResponse),
        (status = 401, description = "Not logged in", body = ErrorResponse),
        (status = 502, description = "Probe failed", body = ErrorResponse)
    )
)]
pub(crate) async fn refresh_access(
    State(state): State<AppState>,
    ctx: Authenticated,
) -> Result<Json<AccessResponse>, ApiError> {
    let active = ctx.active;
    let access = run(&state, &ctx.request_id, move |coordinator, cancel| async move {
        coordinator.refresh_access(&active, &cancel).await
    })
    .await?;
    Ok(Json(AccessResponse {
        access: access.as_ref().clone(),
    }))
}
