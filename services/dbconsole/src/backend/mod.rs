//! Narrow database backend abstraction.
//!
//! # Purpose
//! The console never talks to a driver directly. Everything it needs from the
//! database goes through [`Backend::open`] and the [`Connection`] methods:
//! execute a statement, fetch a bounded window of rows, and drive an explicit
//! BEGIN/COMMIT/ROLLBACK.
//!
//! # Implementations
//! - [`postgres::PostgresBackend`]: sqlx pools partitioned by role.
//! - [`memory::MemoryBackend`]: in-process engine for local development and tests.
//!
//! # Key invariants
//! - A connection is authenticated as exactly the role it was opened for;
//!   [`Connection::role`] reports that role so callers can verify it.
//! - Parameters are positional (`$1`, `$2`, ...) and carried as JSON values.
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub mod memory;
pub mod postgres;

/// A single cell or parameter value.
pub type CellValue = serde_json::Value;

/// Login material for one role.
///
/// `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub role: String,
    pub password: String,
}

impl Credentials {
    pub fn new(role: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("role", &self.role)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Materialized statement result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Number of rows the statement produced, including rows outside the
    /// fetched window.
    pub total: u64,
    /// Rows touched by INSERT/UPDATE/DELETE.
    pub rows_affected: u64,
}

/// Offset/limit window applied while fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowWindow {
    pub offset: u64,
    pub limit: u64,
}

impl RowWindow {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("operation canceled")]
    Canceled,
    #[error("statement failed: {0}")]
    Query(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait Connection: Send {
    /// Role this connection is authenticated as.
    fn role(&self) -> &str;

    /// Database this connection is attached to.
    fn database(&self) -> &str;

    /// Run one statement and materialize every row it returns.
    async fn execute(&mut self, sql: &str, params: &[CellValue]) -> BackendResult<Rows>;

    /// Run one row-returning statement, keeping only the rows inside `window`
    /// while still counting every row into [`Rows::total`].
    async fn fetch_window(
        &mut self,
        sql: &str,
        params: &[CellValue],
        window: RowWindow,
    ) -> BackendResult<Rows> {
        let mut result = self.execute(sql, params).await?;
        result.total = result.rows.len() as u64;
        result.rows = result
            .rows
            .into_iter()
            .skip(window.offset as usize)
            .take(window.limit as usize)
            .collect();
        Ok(result)
    }

    async fn begin_tx(&mut self) -> BackendResult<()>;
    async fn commit_tx(&mut self) -> BackendResult<()>;
    async fn rollback_tx(&mut self) -> BackendResult<()>;

    /// Hand the connection back for reuse.
    fn release(&mut self);

    /// Drop the connection without reuse, used when an in-flight statement was
    /// abandoned and the session state is unknown.
    fn discard(&mut self);
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a connection authenticated as `credentials.role`.
    ///
    /// `database = None` targets the backend's default database.
    async fn open(
        &self,
        credentials: &Credentials,
        database: Option<&str>,
    ) -> BackendResult<Box<dyn Connection>>;

    fn backend_name(&self) -> &'static str;
}
