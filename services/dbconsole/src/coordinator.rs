//! Request coordinator.
//!
//! # Purpose
//! The single facade HTTP handlers call. It turns presented cookies into an
//! authenticated role, routes reads through the broker, write intents through
//! the transaction manager, and returns [`ConsoleError`]s with a uniform kind.
//!
//! # Key invariants
//! - Every list result satisfies `loaded <= hard_cap` and `loaded <= total`.
//! - A tampered cookie of either kind is a hard `auth` failure; a stale,
//!   unknown or expired session falls back to the identity cookie, which logs
//!   the user back in silently when it still opens and was not revoked by a
//!   logout.
//! - Filter text reaches SQL only after [`validate_filter`] accepted it.
use crate::access::gate::AccessGate;
use crate::access::{Operation, RoleAccess, TableRef};
use crate::auth::{ActiveSession, IssuedSession, PresentedCookies, SealError, SessionRegistry};
use crate::backend::{CellValue, Credentials, RowWindow, Rows};
use crate::broker::ConnectionBroker;
use crate::clock::log_prefix;
use crate::error::{ConsoleError, ConsoleResult, ErrorKind};
use crate::sql::builder::{count_rows, order_columns, select_page};
use crate::sql::{alters_session, returns_rows, split_statements, validate_filter, SortOrder};
use crate::txn::{OpRequest, StagedOp, TransactionManager, TransactionView};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Offset pagination as requested by a client. The server clamps `limit` to
/// the hard cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub offset: u64,
    pub limit: Option<u64>,
}

/// One page of rows with its envelope.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PagedResult {
    pub columns: Vec<String>,
    #[schema(value_type = Vec<Vec<Object>>)]
    pub rows: Vec<Vec<CellValue>>,
    /// Rows materialized in this response.
    pub loaded: u64,
    /// Size of the underlying set.
    pub total: u64,
    pub offset: u64,
    pub hard_cap: u64,
}

impl PagedResult {
    fn from_rows(mut rows: Rows, window: RowWindow, hard_cap: u64) -> Self {
        rows.rows.truncate(window.limit as usize);
        let loaded = rows.rows.len() as u64;
        Self {
            columns: rows.columns,
            rows: rows.rows,
            loaded,
            total: rows.total.max(loaded),
            offset: window.offset,
            hard_cap,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableQuery {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub order: SortOrder,
    pub page: PageRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdHocRequest {
    pub sql: String,
    pub params: Vec<CellValue>,
    /// `None` runs against the backend's default database.
    pub database: Option<String>,
    pub page: PageRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StatementResult {
    pub index: usize,
    pub statement: String,
    pub rows_affected: u64,
    pub result: PagedResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct StatementError {
    pub index: usize,
    pub code: String,
    pub message: String,
}

/// Ordered results of an ad-hoc batch. Execution stops at the first failing
/// statement; `error` names it.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AdHocResult {
    pub results: Vec<StatementResult>,
    pub error: Option<StatementError>,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session: IssuedSession,
    pub access: Arc<RoleAccess>,
}

/// A request's authenticated identity. `reissued` is set when the session was
/// re-established from the identity cookie and a new session cookie must be
/// sent.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub active: ActiveSession,
    pub reissued: Option<IssuedSession>,
}

pub struct Coordinator {
    broker: Arc<ConnectionBroker>,
    gate: AccessGate,
    sessions: Arc<SessionRegistry>,
    transactions: Arc<TransactionManager>,
    hard_cap: u64,
}

impl Coordinator {
    pub fn new(
        broker: Arc<ConnectionBroker>,
        gate: AccessGate,
        sessions: Arc<SessionRegistry>,
        transactions: Arc<TransactionManager>,
        hard_cap: u64,
    ) -> Self {
        Self {
            broker,
            gate,
            sessions,
            transactions,
            hard_cap: hard_cap.max(1),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn hard_cap(&self) -> u64 {
        self.hard_cap
    }

    /// Authenticate at the backend, make sure the role's access view is
    /// cached, and mint a session.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> ConsoleResult<LoginOutcome> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(ConsoleError::validation("username and password are required"));
        }
        if username.contains('\0') || password.contains('\0') {
            return Err(ConsoleError::validation("credentials must not contain NUL"));
        }
        let credentials = Credentials::new(username, password);
        let outcome = self.establish(&credentials, cancel).await;
        record_login(&outcome, "success");
        outcome
    }

    /// Map presented cookies to an authenticated session.
    pub async fn resolve(
        &self,
        presented: &PresentedCookies,
        cancel: &CancellationToken,
    ) -> ConsoleResult<ResolvedSession> {
        if let Some(sealed) = &presented.session {
            match self.sessions.open_session_cookie(sealed) {
                Ok(session_id) => match self.sessions.touch(&session_id) {
                    Ok(active) => {
                        self.check_companion_identity(presented, &active)?;
                        return Ok(ResolvedSession {
                            active,
                            reissued: None,
                        });
                    }
                    Err(err) if err.kind.is_auth() => {
                        tracing::debug!(
                            session = log_prefix(&session_id),
                            "session gone, trying identity cookie"
                        );
                    }
                    Err(err) => return Err(err),
                },
                Err(SealError::Tampered) => {
                    tracing::warn!("session cookie failed integrity check");
                    return Err(SealError::Tampered.into());
                }
                Err(err) => {
                    tracing::debug!(error = %err, "session cookie unusable, trying identity cookie");
                }
            }
        }

        let Some(identity) = &presented.identity else {
            return Err(ConsoleError::auth("login required"));
        };
        let opened = self.sessions.open_identity_cookie(identity).inspect_err(|err| {
            tracing::info!(error = %err, "identity cookie rejected");
        })?;
        let outcome = self.establish(&opened.credentials, cancel).await;
        record_login(&outcome, "reauthenticated");
        let outcome = outcome?;
        self.sessions
            .bind_identity(&outcome.session.session_id, &opened.nonce);
        Ok(ResolvedSession {
            active: ActiveSession {
                session_id: outcome.session.session_id.clone(),
                credentials: opened.credentials,
            },
            reissued: Some(outcome.session),
        })
    }

    /// An identity cookie sent next to a live session must still be intact,
    /// unrevoked and name the same user. A merely stale one is ignored.
    fn check_companion_identity(
        &self,
        presented: &PresentedCookies,
        active: &ActiveSession,
    ) -> ConsoleResult<()> {
        let Some(identity) = &presented.identity else {
            return Ok(());
        };
        match self.sessions.open_identity_cookie(identity) {
            Ok(opened) if opened.credentials.role == active.credentials.role => Ok(()),
            Ok(_) => {
                tracing::warn!(
                    session = log_prefix(&active.session_id),
                    "identity cookie names a different user"
                );
                Err(ConsoleError::auth("cookies do not belong together, please log in again"))
            }
            Err(SealError::Stale) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    session = log_prefix(&active.session_id),
                    "identity cookie rejected next to a live session"
                );
                Err(err.into())
            }
        }
    }

    /// End the presented session, revoke the presented identity cookie and
    /// roll back the user's active transaction. When only the identity cookie
    /// is left, the user it names still loses the transaction. Unknown
    /// sessions are ignored.
    pub async fn logout(&self, presented: &PresentedCookies) {
        let removed = presented
            .session
            .as_deref()
            .and_then(|sealed| self.sessions.open_session_cookie(sealed).ok())
            .and_then(|session_id| self.sessions.remove(&session_id));
        let identity = presented
            .identity
            .as_deref()
            .and_then(|sealed| self.sessions.open_identity_cookie(sealed).ok());
        if let Some(opened) = &identity {
            self.sessions.revoke_identity(&opened.nonce);
        }
        let owner = match (removed, identity) {
            (Some(session), _) => Some(session.username),
            (None, Some(opened)) => Some(opened.credentials.role),
            (None, None) => None,
        };
        let Some(owner) = owner else {
            return;
        };
        if let Some(txn) = self.transactions.abandon(&owner).await {
            tracing::info!(
                txn = log_prefix(&txn),
                user = %owner,
                "active transaction rolled back on logout"
            );
        }
    }

    pub async fn list_access(
        &self,
        active: &ActiveSession,
        cancel: &CancellationToken,
    ) -> ConsoleResult<Arc<RoleAccess>> {
        self.gate.view(&active.credentials, cancel).await
    }

    /// Discard the role's cached view and probe again.
    pub async fn refresh_access(
        &self,
        active: &ActiveSession,
        cancel: &CancellationToken,
    ) -> ConsoleResult<Arc<RoleAccess>> {
        self.gate.refresh(&active.credentials, cancel).await
    }

    /// One page of a table: gate check, exact count, then the page itself.
    pub async fn read_table(
        &self,
        active: &ActiveSession,
        target: &TableRef,
        query: &TableQuery,
        cancel: &CancellationToken,
    ) -> ConsoleResult<PagedResult> {
        let table = self
            .gate
            .table_for(&active.credentials, Operation::Select, target, cancel)
            .await?;
        let filter = match query.filter.as_deref() {
            Some(fragment) => validate_filter(fragment)?,
            None => None,
        };
        let order_by = order_columns(&table, query.sort.as_deref())?;
        let window = self.window(&query.page)?;
        let count_sql = count_rows(target, filter.as_deref());
        let page_sql = select_page(
            target,
            filter.as_deref(),
            &order_by,
            query.order,
            window.limit,
            window.offset,
        );

        let (total, mut page) = self
            .broker
            .with_connection(
                &active.credentials,
                Some(&target.database),
                cancel,
                move |conn| {
                    Box::pin(async move {
                        let counted = conn.execute(&count_sql, &[]).await?;
                        let page = conn.execute(&page_sql, &[]).await?;
                        Ok((count_of(&counted), page))
                    })
                },
            )
            .await?;
        // Rows added between COUNT and SELECT must not break `loaded <= total`.
        page.total = total.max(window.offset.saturating_add(page.rows.len() as u64));
        Ok(PagedResult::from_rows(page, window, self.hard_cap))
    }

    /// Run user-authored SQL as the user. A batch separated by `;` runs one
    /// statement at a time, each bounded by the same window.
    pub async fn execute_ad_hoc(
        &self,
        active: &ActiveSession,
        request: AdHocRequest,
        cancel: &CancellationToken,
    ) -> ConsoleResult<AdHocResult> {
        let statements = split_statements(&request.sql)
            .map_err(|err| ConsoleError::validation(format!("could not parse SQL: {err}")))?;
        if statements.is_empty() {
            return Err(ConsoleError::validation("no statement to execute"));
        }
        if !request.params.is_empty() && statements.len() > 1 {
            return Err(ConsoleError::validation(
                "parameters are only accepted with a single statement",
            ));
        }
        if let Some(index) = statements.iter().position(|stmt| alters_session(stmt)) {
            return Err(ConsoleError::validation(format!(
                "statement {} manages the session or transaction; use console transactions instead",
                index + 1
            )));
        }
        if let Some(database) = request.database.as_deref() {
            if !self
                .gate
                .check_database_access(&active.credentials, database, cancel)
                .await?
            {
                return Err(ConsoleError::gate_denied(format!(
                    "database {database:?} is not accessible to this role"
                )));
            }
        }
        let window = self.window(&request.page)?;
        let hard_cap = self.hard_cap;
        let params = request.params;

        let (results, failure) = self
            .broker
            .with_connection(
                &active.credentials,
                request.database.as_deref(),
                cancel,
                move |conn| {
                    Box::pin(async move {
                        let mut results = Vec::with_capacity(statements.len());
                        for (index, statement) in statements.into_iter().enumerate() {
                            let executed = if returns_rows(&statement) {
                                conn.fetch_window(&statement, &params, window).await
                            } else {
                                conn.execute(&statement, &params).await
                            };
                            match executed {
                                Ok(rows) => results.push(StatementResult {
                                    index,
                                    statement,
                                    rows_affected: rows.rows_affected,
                                    result: PagedResult::from_rows(rows, window, hard_cap),
                                }),
                                Err(err) => {
                                    return Ok((results, Some((index, ConsoleError::from(err)))))
                                }
                            }
                        }
                        Ok((results, None))
                    })
                },
            )
            .await?;

        let Some((index, err)) = failure else {
            return Ok(AdHocResult {
                results,
                error: None,
            });
        };
        tracing::info!(
            user = %active.credentials.role,
            index,
            code = err.kind.code(),
            detail = ?err.detail,
            "ad-hoc statement failed"
        );
        // Nothing ran: the failure is the response.
        if results.is_empty() {
            return Err(err);
        }
        Ok(AdHocResult {
            results,
            error: Some(StatementError {
                index,
                code: err.kind.code().to_string(),
                message: err.message,
            }),
        })
    }

    pub async fn start_transaction(
        &self,
        active: &ActiveSession,
        target: TableRef,
        cancel: &CancellationToken,
    ) -> ConsoleResult<TransactionView> {
        self.transactions
            .start(&active.credentials, target, cancel)
            .await
    }

    pub async fn stage_op(
        &self,
        active: &ActiveSession,
        transaction_id: &str,
        request: OpRequest,
        cancel: &CancellationToken,
    ) -> ConsoleResult<StagedOp> {
        self.transactions
            .stage(&active.credentials, transaction_id, request, cancel)
            .await
    }

    pub async fn commit(
        &self,
        active: &ActiveSession,
        transaction_id: &str,
        cancel: &CancellationToken,
    ) -> ConsoleResult<TransactionView> {
        self.transactions
            .commit(&active.credentials, transaction_id, cancel)
            .await
    }

    pub async fn rollback(
        &self,
        active: &ActiveSession,
        transaction_id: &str,
    ) -> ConsoleResult<TransactionView> {
        self.transactions
            .rollback(&active.credentials, transaction_id)
            .await
    }

    pub async fn extend_transaction(
        &self,
        active: &ActiveSession,
        transaction_id: &str,
    ) -> ConsoleResult<TransactionView> {
        self.transactions
            .extend(&active.credentials, transaction_id)
            .await
    }

    pub async fn get_transaction(
        &self,
        active: &ActiveSession,
        transaction_id: &str,
    ) -> ConsoleResult<TransactionView> {
        self.transactions
            .get(&active.credentials, transaction_id)
            .await
    }

    /// Probe connection, cached view, new session.
    async fn establish(
        &self,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> ConsoleResult<LoginOutcome> {
        self.broker
            .with_connection(credentials, None, cancel, |_conn| {
                Box::pin(async move { Ok(()) })
            })
            .await
            .map_err(|err| match err.kind {
                ErrorKind::Auth => {
                    ConsoleError::auth("invalid username or password").with_detail(err)
                }
                _ => err,
            })?;
        let access = self.gate.view(credentials, cancel).await?;
        if access.is_empty() {
            return Err(ConsoleError::new(
                ErrorKind::NoResources,
                "this role has no accessible databases or tables",
            ));
        }
        let session = self.sessions.create(credentials)?;
        Ok(LoginOutcome { session, access })
    }

    fn window(&self, page: &PageRequest) -> ConsoleResult<RowWindow> {
        let limit = match page.limit {
            Some(0) => return Err(ConsoleError::validation("limit must be at least 1")),
            Some(limit) => limit.min(self.hard_cap),
            None => self.hard_cap,
        };
        Ok(RowWindow::new(page.offset, limit))
    }
}

fn record_login<T>(outcome: &ConsoleResult<T>, success: &'static str) {
    let label = match outcome {
        Ok(_) => success,
        Err(err) => err.kind.code(),
    };
    metrics::counter!("dbconsole_logins_total", "outcome" => label).increment(1);
}

/// First cell of a `COUNT(*)` result.
fn count_of(rows: &Rows) -> u64 {
    rows.rows
        .first()
        .and_then(|row| row.first())
        .and_then(|cell| match cell {
            CellValue::Number(number) => number.as_u64(),
            CellValue::String(text) => text.parse().ok(),
            _ => None,
        })
        .unwrap_or(0)
}
