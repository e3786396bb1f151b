//! Staged transaction handlers.
//!
//! # Purpose
//! Thin wrappers over the coordinator's transaction operations. Nothing here
//! touches the database directly; writes reach it only through commit.
use crate::access::TableRef;
use crate::api::error::ApiError;
use crate::api::types::{ErrorResponse, StageResponse, StartTransactionRequest};
use crate::api::{run, Authenticated};
use crate::app::AppState;
use crate::txn::{OpRequest, TransactionView};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

#[utoipa::path(
    post,
    path = "/v1/transactions",
    tag = "transactions",
    request_body = StartTransactionRequest,
    responses(
        (status = 201, description = "Transaction started", body = TransactionView),
        (status = 400, description = "Table not accessible", body = ErrorResponse),
        (status = 409, description = "The user already has an active transaction", body = ErrorResponse)
    )
)]
pub(crate) async fn start(
    State(state): State<AppState>,
    ctx: Authenticated,
    Json(body): Json<StartTransactionRequest>,
) -> Result<(StatusCode, Json<TransactionView>), ApiError> {
    let target = TableRef::new(body.database, body.schema, body.table);
    let active = ctx.active;
    let view = run(&state, &ctx.request_id, move |coordinator, cancel| async move {
        coordinator.start_transaction(&active, target, &cancel).await
    })
    .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[utoipa::path(
    get,
    path = "/v1/transactions/{transaction_id}",
    tag = "transactions",
    params(
        ("transaction_id" = String, Path, description = "Transaction identifier")
    ),
    responses(
        (status = 200, description = "Transaction state and staged log", body = TransactionView),
        (status = 404, description = "No such transaction for this user", body = ErrorResponse)
    )
)]
pub(crate) async fn get(
    Path(transaction_id): Path<String>,
    State(state): State<AppState>,
    ctx: Authenticated,
) -> Result<Json<TransactionView>, ApiError> {
    let active = ctx.active;
    let view = run(&state, &ctx.request_id, move |coordinator, _cancel| async move {
        coordinator.get_transaction(&active, &transaction_id).await
    })
    .await?;
    Ok(Json(view))
}

#[utoipa::path(
    delete,
    path = "/v1/transactions/{transaction_id}",
    tag = "transactions",
    params(
        ("transaction_id" = String, Path, description = "Transaction identifier")
    ),
    responses(
        (status = 200, description = "Rolled back (idempotent)", body = TransactionView),
        (status = 404, description = "No such transaction for this user", body = ErrorResponse),
        (status = 409, description = "Commit in progress or already committed", body = ErrorResponse)
    )
)]
pub(crate) async fn rollback(
    Path(transaction_id): Path<String>,
    State(state): State<AppState>,
    ctx: Authenticated,
) -> Result<Json<TransactionView>, ApiError> {
    let active = ctx.active;
    let view = run(&state, &ctx.request_id, move |coordinator, _cancel| async move {
        coordinator.rollback(&active, &transaction_id).await
    })
    .await?;
    Ok(Json(view))
}

#[utoipa::path(
    post,
    path = "/v1/transactions/{transaction_id}/ops",
    tag = "transactions",
    params(
        ("transaction_id" = String, Path, description = "Transaction identifier")
    ),
    request_body = OpRequest,
    responses(
        (status = 201, description = "Change staged", body = StageResponse),
        (status = 400, description = "Malformed change or privilege missing", body = ErrorResponse),
        (status = 409, description = "Transaction expired or committing", body = ErrorResponse)
    )
)]
pub(crate) async fn stage(
    Path(transaction_id): Path<String>,
    State(state): State<AppState>,
    ctx: Authenticated,
    Json(body): Json<OpRequest>,
) -> Result<(StatusCode, Json<StageResponse>), ApiError> {
    let active = ctx.active;
    let staged = run(&state, &ctx.request_id, move |coordinator, cancel| async move {
        coordinator
            .stage_op(&active, &transaction_id, body, &cancel)
            .await
    })
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(StageResponse {
            seq: staged.seq,
            row: staged.change.row().clone(),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/transactions/{transaction_id}/commit",
    tag = "transactions",
    params(
        ("transaction_id" = String, Path, description = "Transaction identifier")
    ),
    responses(
        (status = 200, description = "Committed", body = TransactionView),
        (status = 400, description = "A privilege was revoked since staging", body = ErrorResponse),
        (status = 403, description = "The database refused a statement", body = ErrorResponse),
        (status = 409, description = "Stale row, expired, or already committing", body = ErrorResponse)
    )
)]
pub(crate) async fn commit(
    Path(transaction_id): Path<String>,
    State(state): State<AppState>,
    ctx: Authenticated,
) -> Result<Json<TransactionView>, ApiError> {
    let active = ctx.active;
    let view = run(&state, &ctx.request_id, move |coordinator, cancel| async move {
        coordinator.commit(&active, &transaction_id, &cancel).await
    })
    .await?;
    Ok(Json(view))
}

#[utoipa::path(
    post,
    path = "/v1/transactions/{transaction_id}/extend",
    tag = "transactions",
    params(
        ("transaction_id" = String, Path, description = "Transaction identifier")
    ),
    responses(
        (status = 200, description = "Deadline pushed to now + lease", body = TransactionView),
        (status = 409, description = "Transaction no longer active", body = ErrorResponse)
    )
)]
pub(crate) async fn extend(
    Path(transaction_id): Path<String>,
    State(state): State<AppState>,
    ctx: Authenticated,
) -> Result<Json<TransactionView>, ApiError> {
    let active = ctx.active;
    let view = run(&state, &ctx.request_id, move |coordinator, _cancel| async move {
        coordinator
            .extend_transaction(&active, &transaction_id)
            .await
    })
    .await?;
    Ok(Json(view))
}
