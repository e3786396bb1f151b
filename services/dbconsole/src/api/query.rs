//! Ad-hoc SQL.
use crate::api::error::ApiError;
use crate::api::types::{ErrorResponse, QueryRequest};
use crate::api::{run, Authenticated};
use crate::app::AppState;
use crate::coordinator::{AdHocRequest, AdHocResult, PageRequest};
use axum::extract::State;
use axum::Json;

#[utoipa::path(
    post,
    path = "/v1/query",
    tag = "query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "Per-statement results; `error` names a failing later statement", body = AdHocResult),
        (status = 400, description = "Unparsable SQL or session-altering statement", body = ErrorResponse),
        (status = 403, description = "The database refused the first statement", body = ErrorResponse),
        (status = 502, description = "The first statement failed", body = ErrorResponse)
    )
)]
pub(crate) async fn execute(
    State(state): State<AppState>,
    ctx: Authenticated,
    Json(body): Json<QueryRequest>,
) -> Result<Json<AdHocResult>, ApiError> {
    let request = AdHocRequest {
        sql: body.sql,
        params: body.params,
        database: body.database,
        page: PageRequest {
            offset: body.offset,
            limit: body.limit,
        },
    };
    let active = ctx.active;
    let result = run(&state, &ctx.request_id, move |coordinator, cancel| async move {
        coordinator.execute_ad_hoc(&active, request, &cancel).await
    })
    .await?;
    Ok(Json(result))
}
