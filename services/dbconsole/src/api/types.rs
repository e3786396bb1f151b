//! Request and response bodies of the HTTP API.
use crate::access::RoleAccess;
use crate::backend::CellValue;
use crate::coordinator::PageRequest;
use crate::sql::SortOrder;
use crate::txn::RowKey;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct HealthStatus {
    pub status: String,
    pub backend: String,
    pub sessions: usize,
    pub transactions: usize,
}

/// Password is only ever read from the request body; it is never echoed.
#[derive(Deserialize, ToSchema, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct LoginResponse {
    pub username: String,
    pub access: RoleAccess,
}

#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct AccessResponse {
    pub access: RoleAccess,
}

/// Query string of a table read.
#[derive(Debug, Deserialize, IntoParams, Clone, Default)]
#[into_params(parameter_in = Query)]
pub struct RowsQuery {
    /// WHERE fragment, e.g. `age > 30 AND name LIKE 'A%'`.
    pub filter: Option<String>,
    /// Column to order by; defaults to the primary key.
    pub sort: Option<String>,
    #[serde(default)]
    #[param(value_type = Option<String>)]
    pub order: SortOrder,
    #[serde(default)]
    pub offset: u64,
    pub limit: Option<u64>,
}

impl RowsQuery {
    pub fn page(&self) -> PageRequest {
        PageRequest {
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema, Clone)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub params: Vec<CellValue>,
    pub database: Option<String>,
    #[serde(default)]
    pub offset: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema, Clone)]
pub struct StartTransactionRequest {
    pub database: String,
    pub schema: String,
    pub table: String,
}

/// Position of a staged change in the log, and the row it addressed. For an
/// insert the row is the synthetic `insert:<n>` key later edits must use.
#[derive(Debug, Serialize, ToSchema, Clone)]
pub struct StageResponse {
    pub seq: u64,
    #[schema(value_type = Object)]
    pub row: RowKey,
}
