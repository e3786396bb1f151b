//! Table browsing.
use crate::access::TableRef;
use crate::api::error::ApiError;
use crate::api::types::{ErrorResponse, RowsQuery};
use crate::api::{run, Authenticated};
use crate::app::AppState;
use crate::coordinator::{PagedResult, TableQuery};
use axum::extract::{Path, Query, State};
use axum::Json;

#[utoipa::path(
    get,
    path = "/v1/tables/{database}/{schema}/{table}/rows",
    tag = "tables",
    params(
        ("database" = String, Path, description = "Database name"),
        ("schema" = String, Path, description = "Schema name"),
        ("table" = String, Path, description = "Table name"),
        RowsQuery
    ),
    responses(
        (status = 200, description = "One page of rows", body = PagedResult),
        (status = 400, description = "Rejected filter, unknown sort column, or table not accessible", body = ErrorResponse),
        (status = 403, description = "The database refused the read", body = ErrorResponse)
    )
)]
pub(crate) async fn read_rows(
    Path((database, schema, table)): Path<(String, String, String)>,
    Query(query): Query<RowsQuery>,
    State(state): State<AppState>,
    ctx: Authenticated,
) -> Result<Json<PagedResult>, ApiError> {
    let target = TableRef::new(database, schema, table);
    let table_query = TableQuery {
        page: query.page(),
        filter: query.filter,
        sort: query.sort,
        order: query.order,
    };
    let active = ctx.active;
    let page = run(&state, &ctx.request_id, move |coordinator, cancel| async move {
        coordinator
            .read_table(&active, &target, &table_query, &cancel)
            .await
    })
    .await?;
    Ok(Json(page))
}
