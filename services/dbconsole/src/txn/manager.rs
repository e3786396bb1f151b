//! Transaction manager.
//!
//! # Purpose
//! Owns every console transaction: creation (one active per user), staging
//! behind the RBAC gate, commit through a single backend transaction,
//! rollback, lease extension, expiry and reaping.
//!
//! # Concurrency model
//! - `by_owner` (user -> transaction id) and `by_id` are sharded maps; no
//!   guard on either is held across an await.
//! - Each transaction sits behind its own `tokio::sync::Mutex`. Backend work
//!   during commit runs with that mutex released and the state set to
//!   `Committing`, so staging attempts fail fast with `busy`.
//! - Expiry is checked lazily under the per-transaction mutex on every access;
//!   the background reaper only makes it happen sooner and frees memory.
//!
//! # Commit
//! 1. Gate re-check of every staged entry against the current access view.
//! 2. Collapse rewrite, statement building (primary key equality predicates).
//! 3. BEGIN, statements in order, COMMIT on one connection owned by the user.
//!    An update or delete touching zero rows is a stale row. Any failure
//!    issues ROLLBACK and returns the transaction to `active` with the
//!    offending entry recorded.
use crate::access::gate::AccessGate;
use crate::access::{Operation, TableRef};
use crate::backend::{CellValue, Credentials};
use crate::broker::ConnectionBroker;
use crate::clock::{log_prefix, new_id, Clock, SharedClock};
use crate::error::{ConsoleError, ConsoleResult, ErrorKind};
use crate::sql::builder;
use crate::sql::Statement;
use crate::txn::collapse::{collapse, Collapsed};
use crate::txn::{
    canonicalize, validate_change, CommitFailure, OpRequest, RowKey, StagedChange, StagedOp,
    TransactionView, TxState,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct TransactionPolicy {
    /// Lifetime of a transaction from start (or last extension).
    pub lease: Duration,
    /// How long terminal transactions stay visible before reaping.
    pub grace: Duration,
    pub max_ops: usize,
}

#[derive(Debug)]
struct Transaction {
    id: String,
    owner: String,
    target: TableRef,
    ops: Vec<StagedOp>,
    next_seq: u64,
    next_insert: u64,
    deadline: Instant,
    state: TxState,
    last_error: Option<CommitFailure>,
    finished_at: Option<Instant>,
}

impl Transaction {
    fn view(&self, now: Instant) -> TransactionView {
        let expires_in_ms = if self.state.is_terminal() {
            0
        } else {
            self.deadline.saturating_duration_since(now).as_millis() as u64
        };
        TransactionView {
            id: self.id.clone(),
            owner: self.owner.clone(),
            target: self.target.clone(),
            state: self.state,
            ops: self.ops.clone(),
            expires_in_ms,
            last_error: self.last_error.clone(),
        }
    }
}

type Handle = Arc<Mutex<Transaction>>;

/// Statement planned from one collapsed entry.
struct Planned {
    statement: Statement,
    /// Updates and deletes must touch a row.
    checked: bool,
    seq: Option<u64>,
}

struct ReplayFailure {
    error: ConsoleError,
    op_seq: Option<u64>,
}

impl From<ConsoleError> for ReplayFailure {
    fn from(error: ConsoleError) -> Self {
        Self {
            error,
            op_seq: None,
        }
    }
}

/// Puts a transaction back to `active` if a commit future is dropped midway.
struct CommitGuard {
    handle: Option<Handle>,
}

impl CommitGuard {
    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let mut tx = handle.lock().await;
            if tx.state == TxState::Committing {
                tx.state = TxState::Active;
                tx.last_error = Some(CommitFailure {
                    code: ErrorKind::Canceled.code().to_string(),
                    message: "commit was interrupted".to_string(),
                    op_seq: None,
                });
                tracing::warn!(txn = log_prefix(&tx.id), "commit interrupted, transaction reactivated");
            }
        });
    }
}

pub struct TransactionManager {
    by_id: DashMap<String, Handle>,
    by_owner: DashMap<String, String>,
    gate: AccessGate,
    broker: Arc<ConnectionBroker>,
    clock: SharedClock,
    policy: TransactionPolicy,
    active: AtomicUsize,
}

impl TransactionManager {
    pub fn new(
        gate: AccessGate,
        broker: Arc<ConnectionBroker>,
        clock: SharedClock,
        policy: TransactionPolicy,
    ) -> Self {
        Self {
            by_id: DashMap::new(),
            by_owner: DashMap::new(),
            gate,
            broker,
            clock,
            policy,
            active: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> TransactionPolicy {
        self.policy
    }

    /// Start a transaction on `target` for the credentials' role.
    ///
    /// Fails with `conflict` while another transaction of the same user is
    /// active or committing.
    pub async fn start(
        &self,
        credentials: &Credentials,
        target: TableRef,
        cancel: &CancellationToken,
    ) -> ConsoleResult<TransactionView> {
        self.gate
            .table_for(credentials, Operation::Select, &target, cancel)
            .await?;
        let owner = credentials.role.clone();

        // Liveness of the current holder is decided under its own mutex,
        // before touching the index.
        let observed = self.by_owner.get(&owner).map(|entry| entry.value().clone());
        if let Some(existing) = &observed {
            if let Some(handle) = self.lookup(existing) {
                let mut tx = handle.lock().await;
                self.expire_if_due(&mut tx);
                if !tx.state.is_terminal() {
                    return Err(already_active());
                }
            }
        }

        let now = self.clock.now();
        let tx = Transaction {
            id: new_id(),
            owner: owner.clone(),
            target,
            ops: Vec::new(),
            next_seq: 1,
            next_insert: 0,
            deadline: now + self.policy.lease,
            state: TxState::Active,
            last_error: None,
            finished_at: None,
        };
        let id = tx.id.clone();
        let view = tx.view(now);
        let handle = Arc::new(Mutex::new(tx));
        match self.by_owner.entry(owner.clone()) {
            Entry::Occupied(mut slot) => {
                // Someone else started (or replaced) in the meantime.
                if observed.as_deref() != Some(slot.get().as_str()) {
                    return Err(already_active());
                }
                self.by_id.insert(id.clone(), handle);
                slot.insert(id.clone());
            }
            Entry::Vacant(slot) => {
                self.by_id.insert(id.clone(), handle);
                slot.insert(id.clone());
            }
        }
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("dbconsole_transactions_active").set(active as f64);
        tracing::info!(
            txn = log_prefix(&id),
            owner = %owner,
            target = %view.target,
            "transaction started"
        );
        Ok(view)
    }

    /// Append one change after the gate approves it.
    pub async fn stage(
        &self,
        credentials: &Credentials,
        id: &str,
        request: OpRequest,
        cancel: &CancellationToken,
    ) -> ConsoleResult<StagedOp> {
        let handle = self.handle(id)?;
        let target = {
            let tx = self.lock(&credentials.role, &handle).await?;
            ensure_open(&tx)?;
            tx.target.clone()
        };
        // The gate may probe; do it without holding the transaction.
        let table = self
            .gate
            .table_for(credentials, request.operation(), &target, cancel)
            .await?;
        validate_change(&table, &request)?;
        let request = canonicalize(&table, request)?;

        let mut tx = self.lock(&credentials.role, &handle).await?;
        ensure_open(&tx)?;
        if tx.ops.len() >= self.policy.max_ops {
            return Err(ConsoleError::validation(format!(
                "a transaction holds at most {} staged changes",
                self.policy.max_ops
            )));
        }
        let change = match request {
            OpRequest::UpdateCell {
                row,
                column,
                old_value,
                new_value,
            } => StagedChange::UpdateCell {
                row,
                column,
                old_value,
                new_value,
            },
            OpRequest::DeleteRow { row } => StagedChange::DeleteRow { row },
            OpRequest::InsertRow { values } => StagedChange::InsertRow {
                row: RowKey::staged(tx.next_insert + 1),
                values,
            },
        };
        let op = StagedOp {
            seq: tx.next_seq,
            change,
            created_at: self.clock.now(),
        };
        // Refuse entries the log could never collapse.
        collapse(tx.ops.iter().chain(std::iter::once(&op)))?;
        if matches!(op.change, StagedChange::InsertRow { .. }) {
            tx.next_insert += 1;
        }
        tx.next_seq += 1;
        tx.ops.push(op.clone());
        tracing::debug!(
            txn = log_prefix(id),
            seq = op.seq,
            op = %op.change.operation(),
            "change staged"
        );
        Ok(op)
    }

    pub async fn commit(
        &self,
        credentials: &Credentials,
        id: &str,
        cancel: &CancellationToken,
    ) -> ConsoleResult<TransactionView> {
        let handle = self.handle(id)?;
        let (target, ops) = {
            let mut tx = self.lock(&credentials.role, &handle).await?;
            ensure_open(&tx)?;
            tx.state = TxState::Committing;
            tx.last_error = None;
            (tx.target.clone(), tx.ops.clone())
        };

        let mut guard = CommitGuard {
            handle: Some(handle.clone()),
        };
        let outcome = self.replay(credentials, &target, &ops, cancel).await;
        guard.disarm();

        let mut tx = handle.lock().await;
        let now = self.clock.now();
        match outcome {
            Ok(statements) => {
                tx.state = TxState::Committed;
                tx.finished_at = Some(now);
                self.finished();
                metrics::counter!("dbconsole_commits_total", "outcome" => "committed")
                    .increment(1);
                tracing::info!(
                    txn = log_prefix(id),
                    staged = ops.len(),
                    statements,
                    "transaction committed"
                );
                Ok(tx.view(now))
            }
            Err(failure) => {
                tx.state = TxState::Active;
                tx.last_error = Some(CommitFailure::new(&failure.error, failure.op_seq));
                metrics::counter!("dbconsole_commits_total", "outcome" => failure.error.kind.code())
                    .increment(1);
                tracing::warn!(
                    txn = log_prefix(id),
                    code = failure.error.kind.code(),
                    op_seq = ?failure.op_seq,
                    detail = ?failure.error.detail,
                    "commit failed, transaction remains active"
                );
                Err(failure.error)
            }
        }
    }

    /// Discard staging. Rolling back an already rolled back or expired
    /// transaction succeeds without effect.
    pub async fn rollback(
        &self,
        credentials: &Credentials,
        id: &str,
    ) -> ConsoleResult<TransactionView> {
        let handle = self.handle(id)?;
        let mut tx = self.lock(&credentials.role, &handle).await?;
        let now = self.clock.now();
        match tx.state {
            TxState::Active => {
                self.terminate(&mut tx, TxState::RolledBack, now);
                tracing::info!(txn = log_prefix(id), "transaction rolled back");
            }
            TxState::RolledBack | TxState::Expired => {}
            TxState::Committing => return Err(committing()),
            TxState::Committed => {
                return Err(ConsoleError::conflict("transaction is already committed"))
            }
        }
        Ok(tx.view(now))
    }

    /// Reset the deadline to `now + lease`.
    pub async fn extend(
        &self,
        credentials: &Credentials,
        id: &str,
    ) -> ConsoleResult<TransactionView> {
        let handle = self.handle(id)?;
        let mut tx = self.lock(&credentials.role, &handle).await?;
        ensure_open(&tx)?;
        let now = self.clock.now();
        tx.deadline = now + self.policy.lease;
        Ok(tx.view(now))
    }

    pub async fn get(
        &self,
        credentials: &Credentials,
        id: &str,
    ) -> ConsoleResult<TransactionView> {
        let handle = self.handle(id)?;
        let tx = self.lock(&credentials.role, &handle).await?;
        Ok(tx.view(self.clock.now()))
    }

    /// Id of the user's current (non-reaped) transaction, if any.
    pub fn current_for(&self, owner: &str) -> Option<String> {
        self.by_owner.get(owner).map(|entry| entry.value().clone())
    }

    /// Roll back the user's active transaction, if there is one.
    pub async fn abandon(&self, owner: &str) -> Option<String> {
        let id = self.current_for(owner)?;
        let handle = self.lookup(&id)?;
        let mut tx = handle.lock().await;
        self.expire_if_due(&mut tx);
        if tx.state != TxState::Active {
            return None;
        }
        self.terminate(&mut tx, TxState::RolledBack, self.clock.now());
        tracing::info!(txn = log_prefix(&id), owner, "transaction abandoned");
        Some(id)
    }

    /// Expire overdue transactions and drop terminal ones older than the
    /// grace window. Returns how many were dropped.
    pub async fn reap(&self) -> usize {
        let handles: Vec<(String, Handle)> = self
            .by_id
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut reaped = 0;
        for (id, handle) in handles {
            let (owner, remove) = {
                let mut tx = handle.lock().await;
                self.expire_if_due(&mut tx);
                let now = self.clock.now();
                let remove = tx.state.is_terminal()
                    && tx
                        .finished_at
                        .map(|at| now.saturating_duration_since(at) >= self.policy.grace)
                        .unwrap_or(false);
                (tx.owner.clone(), remove)
            };
            if remove {
                self.by_id.remove(&id);
                self.by_owner.remove_if(&owner, |_, current| current == &id);
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::debug!(reaped, "terminal transactions reaped");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn lookup(&self, id: &str) -> Option<Handle> {
        self.by_id.get(id).map(|entry| entry.value().clone())
    }

    fn handle(&self, id: &str) -> ConsoleResult<Handle> {
        self.lookup(id).ok_or_else(not_found)
    }

    /// Lock a transaction owned by `owner`, applying lazy expiry. Another
    /// user's transaction is reported as not found.
    async fn lock<'a>(
        &self,
        owner: &str,
        handle: &'a Handle,
    ) -> ConsoleResult<MutexGuard<'a, Transaction>> {
        let mut tx = handle.lock().await;
        if tx.owner != owner {
            return Err(not_found());
        }
        self.expire_if_due(&mut tx);
        Ok(tx)
    }

    fn expire_if_due(&self, tx: &mut Transaction) {
        let now = self.clock.now();
        if tx.state != TxState::Active || now < tx.deadline {
            return;
        }
        let staged = tx.ops.len();
        self.terminate(tx, TxState::Expired, now);
        metrics::counter!("dbconsole_transactions_expired_total").increment(1);
        tracing::info!(
            txn = log_prefix(&tx.id),
            owner = %tx.owner,
            staged,
            "transaction expired"
        );
    }

    fn terminate(&self, tx: &mut Transaction, state: TxState, now: Instant) {
        tx.state = state;
        tx.ops.clear();
        tx.finished_at = Some(now);
        self.finished();
    }

    fn finished(&self) {
        let previous = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        metrics::gauge!("dbconsole_transactions_active").set(previous.saturating_sub(1) as f64);
    }

    async fn replay(
        &self,
        credentials: &Credentials,
        target: &TableRef,
        ops: &[StagedOp],
        cancel: &CancellationToken,
    ) -> Result<usize, ReplayFailure> {
        let view = self.gate.view(credentials, cancel).await?;
        let Some(table) = view.table(target).cloned() else {
            return Err(ReplayFailure {
                error: ConsoleError::gate_denied(format!(
                    "{target} is no longer visible to this role"
                )),
                op_seq: ops.first().map(|op| op.seq),
            });
        };
        for op in ops {
            let operation = op.change.operation();
            if !table.privileges.allows(operation) {
                return Err(ReplayFailure {
                    error: ConsoleError::gate_denied(format!(
                        "{operation} on {target} is no longer permitted for this role"
                    )),
                    op_seq: Some(op.seq),
                });
            }
        }

        let mut planned = Vec::new();
        for entry in collapse(ops)? {
            let seq = entry.seqs().first().copied();
            let built = match &entry {
                Collapsed::Insert { values, .. } => {
                    builder::insert_row(target, &table, values).map(|statement| (statement, false))
                }
                Collapsed::Update { row, cells, .. } => {
                    let assignments: Vec<(String, CellValue)> = cells
                        .iter()
                        .map(|cell| (cell.column.clone(), cell.new_value.clone()))
                        .collect();
                    builder::update_cells(target, &table, &assignments, &row.primary_columns(&table))
                        .map(|statement| (statement, true))
                }
                Collapsed::Delete { row, .. } => {
                    builder::delete_row(target, &table, &row.primary_columns(&table))
                        .map(|statement| (statement, true))
                }
            };
            let (statement, checked) =
                built.map_err(|error| ReplayFailure { error, op_seq: seq })?;
            planned.push(Planned {
                statement,
                checked,
                seq,
            });
        }
        if planned.is_empty() {
            return Ok(0);
        }

        self.broker
            .with_connection(credentials, Some(&target.database), cancel, move |conn| {
                Box::pin(async move {
                    conn.begin_tx().await?;
                    for step in &planned {
                        let failure = match conn
                            .execute(&step.statement.sql, &step.statement.params)
                            .await
                        {
                            Ok(rows) if step.checked && rows.rows_affected == 0 => {
                                Some(ReplayFailure {
                                    error: ConsoleError::new(
                                        ErrorKind::StaleRow,
                                        "a staged row no longer exists in the database",
                                    ),
                                    op_seq: step.seq,
                                })
                            }
                            Ok(_) => None,
                            Err(err) => Some(ReplayFailure {
                                error: err.into(),
                                op_seq: step.seq,
                            }),
                        };
                        if let Some(failure) = failure {
                            if let Err(err) = conn.rollback_tx().await {
                                tracing::warn!(error = %err, "rollback after failed replay did not complete");
                            }
                            return Ok(Err(failure));
                        }
                    }
                    conn.commit_tx().await?;
                    Ok(Ok(planned.len()))
                })
            })
            .await?
    }
}

fn ensure_open(tx: &Transaction) -> ConsoleResult<()> {
    match tx.state {
        TxState::Active => Ok(()),
        TxState::Committing => Err(committing()),
        TxState::Expired => Err(ConsoleError::expired("transaction expired")),
        TxState::Committed | TxState::RolledBack => Err(ConsoleError::conflict(format!(
            "transaction is {}",
            tx.state
        ))),
    }
}

fn already_active() -> ConsoleError {
    ConsoleError::conflict("a transaction is already active for this user")
}

fn committing() -> ConsoleError {
    ConsoleError::busy("transaction is committing")
}

fn not_found() -> ConsoleError {
    ConsoleError::not_found("transaction not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::cache::{AccessCache, BrokerAccessSource};
    use crate::access::Privileges;
    use crate::backend::memory::{ColumnDef, MemoryBackend, TableDef};
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Fixture {
        manager: TransactionManager,
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        alice: Credentials,
        users: TableRef,
        cancel: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new("testdb"));
        backend.add_role("alice", "p1").await;
        let users = TableRef::new("testdb", "public", "users");
        backend
            .create_table(
                &users,
                TableDef {
                    columns: vec![
                        ColumnDef::new("id", "integer", false),
                        ColumnDef::new("name", "text", true),
                    ],
                    primary_key: vec!["id".to_string()],
                    ..TableDef::default()
                },
            )
            .await;
        backend
            .insert_rows(&users, vec![vec![json!(7), json!("old")], vec![json!(8), json!("b")]])
            .await
            .expect("seed");
        backend
            .grant(&users, "alice", Privileges::all())
            .await
            .expect("grant");

        let broker = Arc::new(ConnectionBroker::new(backend.clone(), 2));
        let gate = AccessGate::new(
            Arc::new(AccessCache::new()),
            Arc::new(BrokerAccessSource::new(broker.clone())),
        );
        let clock = Arc::new(ManualClock::new());
        let manager = TransactionManager::new(
            gate,
            broker,
            clock.clone(),
            TransactionPolicy {
                lease: Duration::from_secs(60),
                grace: Duration::from_secs(30),
                max_ops: 16,
            },
        );
        Fixture {
            manager,
            backend,
            clock,
            alice: Credentials::new("alice", "p1"),
            users,
            cancel: CancellationToken::new(),
        }
    }

    fn pk(id: i64) -> RowKey {
        RowKey::Primary(BTreeMap::from([("id".to_string(), json!(id))]))
    }

    fn rename(id: i64, old: &str, new: &str) -> OpRequest {
        OpRequest::UpdateCell {
            row: pk(id),
            column: "name".to_string(),
            old_value: json!(old),
            new_value: json!(new),
        }
    }

    #[tokio::test]
    async fn one_active_transaction_per_user() {
        let f = fixture().await;
        let first = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        let err = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect_err("second start");
        assert_eq!(err.kind, ErrorKind::Conflict);

        f.manager.rollback(&f.alice, &first.id).await.expect("rollback");
        f.manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start after rollback");
    }

    #[tokio::test]
    async fn commit_applies_collapsed_changes() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        for request in [
            rename(7, "old", "mid"),
            rename(7, "mid", "new"),
            OpRequest::DeleteRow { row: pk(8) },
            OpRequest::InsertRow {
                values: BTreeMap::from([("id".to_string(), json!(9))]),
            },
        ] {
            f.manager
                .stage(&f.alice, &tx.id, request, &f.cancel)
                .await
                .expect("stage");
        }
        let staged = f
            .manager
            .stage(
                &f.alice,
                &tx.id,
                OpRequest::UpdateCell {
                    row: RowKey::staged(1),
                    column: "name".to_string(),
                    old_value: CellValue::Null,
                    new_value: json!("nine"),
                },
                &f.cancel,
            )
            .await
            .expect("edit staged insert");
        assert_eq!(staged.seq, 5);

        let view = f
            .manager
            .commit(&f.alice, &tx.id, &f.cancel)
            .await
            .expect("commit");
        assert_eq!(view.state, TxState::Committed);
        let rows = f.backend.rows(&f.users).await.expect("rows");
        assert_eq!(
            rows,
            vec![vec![json!(7), json!("new")], vec![json!(9), json!("nine")]]
        );
    }

    #[tokio::test]
    async fn stale_row_keeps_transaction_active() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        f.manager
            .stage(&f.alice, &tx.id, rename(7, "old", "new"), &f.cancel)
            .await
            .expect("stage");
        f.backend
            .delete_where(&f.users, "id", &json!(7))
            .await
            .expect("external delete");

        let err = f
            .manager
            .commit(&f.alice, &tx.id, &f.cancel)
            .await
            .expect_err("stale");
        assert_eq!(err.kind, ErrorKind::StaleRow);
        let view = f.manager.get(&f.alice, &tx.id).await.expect("view");
        assert_eq!(view.state, TxState::Active);
        assert_eq!(view.ops.len(), 1);
        assert_eq!(
            view.last_error.as_ref().and_then(|failure| failure.op_seq),
            Some(1)
        );
        assert_eq!(f.backend.rows(&f.users).await.expect("rows").len(), 1);
    }

    #[tokio::test]
    async fn deadline_boundaries() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        f.manager
            .stage(&f.alice, &tx.id, rename(7, "old", "new"), &f.cancel)
            .await
            .expect("stage");
        f.clock.advance(Duration::from_millis(59_999));
        f.manager
            .commit(&f.alice, &tx.id, &f.cancel)
            .await
            .expect("commit just before the deadline");

        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start again");
        f.manager
            .stage(&f.alice, &tx.id, rename(7, "new", "newer"), &f.cancel)
            .await
            .expect("stage");
        f.clock.advance(Duration::from_millis(60_001));
        let err = f
            .manager
            .commit(&f.alice, &tx.id, &f.cancel)
            .await
            .expect_err("expired");
        assert_eq!(err.kind, ErrorKind::Expired);
        let view = f.manager.rollback(&f.alice, &tx.id).await.expect("no-op rollback");
        assert_eq!(view.state, TxState::Expired);
        assert!(view.ops.is_empty());
    }

    #[tokio::test]
    async fn extension_resets_the_deadline() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        f.clock.advance(Duration::from_secs(50));
        f.manager.extend(&f.alice, &tx.id).await.expect("extend");
        f.clock.advance(Duration::from_secs(50));
        f.manager
            .stage(&f.alice, &tx.id, rename(7, "old", "new"), &f.cancel)
            .await
            .expect("stage after extension");
    }

    #[tokio::test]
    async fn differently_spelled_keys_collapse_onto_one_row() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        f.manager
            .stage(&f.alice, &tx.id, rename(7, "old", "new"), &f.cancel)
            .await
            .expect("rename");
        let delete = f
            .manager
            .stage(
                &f.alice,
                &tx.id,
                OpRequest::DeleteRow {
                    row: RowKey::Primary(BTreeMap::from([("id".to_string(), json!(7.0))])),
                },
                &f.cancel,
            )
            .await
            .expect("delete");
        assert_eq!(delete.change.row(), &pk(7));

        let err = f
            .manager
            .stage(
                &f.alice,
                &tx.id,
                OpRequest::UpdateCell {
                    row: RowKey::Primary(BTreeMap::from([("id".to_string(), json!("7"))])),
                    column: "name".to_string(),
                    old_value: json!("new"),
                    new_value: json!("again"),
                },
                &f.cancel,
            )
            .await
            .expect_err("row already deleted");
        assert_eq!(err.kind, ErrorKind::Validation);

        let view = f
            .manager
            .commit(&f.alice, &tx.id, &f.cancel)
            .await
            .expect("commit");
        assert_eq!(view.state, TxState::Committed);
        let rows = f.backend.rows(&f.users).await.expect("rows");
        assert_eq!(rows, vec![vec![json!(8), json!("b")]]);
    }

    #[tokio::test]
    async fn staging_while_committing_is_busy() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        let handle = f.manager.handle(&tx.id).expect("handle");
        handle.lock().await.state = TxState::Committing;
        let err = f
            .manager
            .stage(&f.alice, &tx.id, rename(7, "old", "new"), &f.cancel)
            .await
            .expect_err("busy");
        assert_eq!(err.kind, ErrorKind::Busy);
    }

    #[tokio::test]
    async fn gate_denies_staging_without_privilege() {
        let f = fixture().await;
        f.backend
            .grant(&f.users, "alice", Privileges::read_only())
            .await
            .expect("downgrade");
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        let err = f
            .manager
            .stage(&f.alice, &tx.id, rename(7, "old", "new"), &f.cancel)
            .await
            .expect_err("denied");
        assert_eq!(err.kind, ErrorKind::GateDenied);
        assert!(f.manager.get(&f.alice, &tx.id).await.expect("view").ops.is_empty());
    }

    #[tokio::test]
    async fn backend_denial_after_gate_approval_surfaces() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        f.manager
            .stage(&f.alice, &tx.id, rename(7, "old", "new"), &f.cancel)
            .await
            .expect("stage");
        f.backend.revoke(&f.users, "alice").await.expect("revoke");
        let err = f
            .manager
            .commit(&f.alice, &tx.id, &f.cancel)
            .await
            .expect_err("backend denied");
        assert_eq!(err.kind, ErrorKind::BackendDenied);
        assert_eq!(
            f.manager.get(&f.alice, &tx.id).await.expect("view").state,
            TxState::Active
        );
    }

    #[tokio::test]
    async fn other_users_cannot_see_a_transaction() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        let err = f
            .manager
            .get(&Credentials::new("bob", "x"), &tx.id)
            .await
            .expect_err("hidden");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn reaper_expires_and_drops_after_grace() {
        let f = fixture().await;
        let tx = f
            .manager
            .start(&f.alice, f.users.clone(), &f.cancel)
            .await
            .expect("start");
        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.manager.reap().await, 0);
        assert_eq!(
            f.manager.get(&f.alice, &tx.id).await.expect("view").state,
            TxState::Expired
        );
        f.clock.advance(Duration::from_secs(31));
        assert_eq!(f.manager.reap().await, 1);
        assert!(f.manager.is_empty());
        assert!(f.manager.current_for("alice").is_none());
    }
}
