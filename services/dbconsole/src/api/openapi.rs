//! OpenAPI schema aggregation for the console API.
use crate::access::{
    ColumnInfo, DatabaseAccess, ForeignKey, Operation, Privileges, RoleAccess, SchemaAccess,
    TableAccess, TableRef,
};
use crate::api::{
    access, query, session, system, tables, transactions,
    types::{
        AccessResponse, ErrorResponse, HealthStatus, LoginRequest, LoginResponse, QueryRequest,
        StageResponse, StartTransactionRequest,
    },
};
use crate::coordinator::{AdHocResult, PagedResult, StatementError, StatementResult};
use crate::sql::SortOrder;
use crate::txn::{CommitFailure, OpRequest, TransactionView, TxState};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "dbconsole",
        version = "v1",
        description = "Multi-user database console HTTP API"
    ),
    paths(
        system::system_health,
        session::login,
        session::logout,
        access::list_access,
        access::refresh_access,
        tables::read_rows,
        query::execute,
        transactions::start,
        transactions::get,
        transactions::rollback,
        transactions::stage,
        transactions::commit,
        transactions::extend
    ),
    components(schemas(
        ErrorResponse,
        HealthStatus,
        LoginRequest,
        LoginResponse,
        AccessResponse,
        QueryRequest,
        StartTransactionRequest,
        StageResponse,
        RoleAccess,
        DatabaseAccess,
        SchemaAccess,
        TableAccess,
        ColumnInfo,
        ForeignKey,
        Privileges,
        Operation,
        TableRef,
        SortOrder,
        PagedResult,
        AdHocResult,
        StatementResult,
        StatementError,
        OpRequest,
        TransactionView,
        TxState,
        CommitFailure
    )),
    tags(
        (name = "auth", description = "Login and logout"),
        (name = "access", description = "What the logged-in role can see"),
        (name = "tables", description = "Paged table reads"),
        (name = "query", description = "Ad-hoc SQL"),
        (name = "transactions", description = "Staged edits and commit"),
        (name = "system", description = "Health")
    )
)]
pub struct ApiDoc;
