//! Transaction manager properties against the in-memory backend.
use dbconsole::access::cache::{AccessCache, BrokerAccessSource};
use dbconsole::access::gate::AccessGate;
use dbconsole::access::{Operation, Privileges, TableRef};
use dbconsole::backend::memory::{ColumnDef, MemoryBackend, TableDef};
use dbconsole::backend::Credentials;
use dbconsole::broker::ConnectionBroker;
use dbconsole::clock::{ManualClock, SharedClock};
use dbconsole::error::ErrorKind;
use dbconsole::txn::manager::{TransactionManager, TransactionPolicy};
use dbconsole::txn::{OpRequest, RowKey, TxState};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SEED_ROWS: i64 = 5;

fn users() -> TableRef {
    TableRef::new("testdb", "public", "users")
}

fn editor() -> Credentials {
    Credentials::new("editor", "p4")
}

struct Harness {
    backend: Arc<MemoryBackend>,
    gate: AccessGate,
    manager: Arc<TransactionManager>,
    clock: Arc<ManualClock>,
}

async fn harness(lease: Duration) -> Harness {
    let backend = Arc::new(MemoryBackend::new("testdb"));
    backend.add_role("editor", "p4").await;
    backend
        .create_table(
            &users(),
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
        .grant(&users(), "editor", Privileges::all())
        .await
        .expect("grant");
    let rows = (1..=SEED_ROWS)
        .map(|id| vec![json!(id), json!(format!("user{id}"))])
        .collect();
    backend.insert_rows(&users(), rows).await.expect("rows");

    let broker = Arc::new(ConnectionBroker::new(backend.clone(), 4));
    let gate = AccessGate::new(
        Arc::new(AccessCache::new()),
        Arc::new(BrokerAccessSource::new(broker.clone())),
    );
    let clock = Arc::new(ManualClock::new());
    let shared: SharedClock = clock.clone();
    let manager = Arc::new(TransactionManager::new(
        gate.clone(),
        broker,
        shared,
        TransactionPolicy {
            lease,
            grace: Duration::from_secs(60),
            max_ops: 1000,
        },
    ));
    Harness {
        backend,
        gate,
        manager,
        clock,
    }
}

async fn table_state(backend: &MemoryBackend) -> BTreeMap<i64, String> {
    backend
        .rows(&users())
        .await
        .expect("rows")
        .into_iter()
        .map(|row| {
            let id = match &row[0] {
                Value::Number(n) => n.as_i64().expect("integer id"),
                Value::String(s) => s.parse().expect("integer id"),
                other => panic!("unexpected id {other}"),
            };
            (id, row[1].as_str().unwrap_or_default().to_string())
        })
        .collect()
}

fn primary(id: i64) -> RowKey {
    RowKey::Primary(BTreeMap::from([("id".to_string(), json!(id))]))
}

#[derive(Debug, Clone)]
enum Action {
    Update { id: i64, value: u8 },
    Delete { id: i64 },
    Insert,
    Flip { insert: bool, update: bool, delete: bool },
    Refresh,
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        4 => (1..=SEED_ROWS, 0u8..4).prop_map(|(id, value)| Action::Update { id, value }),
        2 => (1..=SEED_ROWS).prop_map(|id| Action::Delete { id }),
        2 => Just(Action::Insert),
        2 => (any::<bool>(), any::<bool>(), any::<bool>())
            .prop_map(|(insert, update, delete)| Action::Flip { insert, update, delete }),
        1 => Just(Action::Refresh),
    ]
}

/// Run one random session of staging, grant flips and refreshes, then commit
/// or roll back after a final refresh.
async fn run_session(actions: Vec<Action>, commit: bool) -> Result<(), TestCaseError> {
    let h = harness(Duration::from_secs(300)).await;
    let cancel = CancellationToken::new();
    let creds = editor();
    let before = table_state(&h.backend).await;

    let view = h
        .manager
        .start(&creds, users(), &cancel)
        .await
        .map_err(|err| TestCaseError::fail(format!("start: {err}")))?;
    let id = view.id;

    let mut granted = Privileges::all();
    let mut cached = Privileges::all();
    let mut model = before.clone();
    let mut staged_ops: Vec<Operation> = Vec::new();
    let mut next_insert = 100i64;

    for action in actions {
        let request = match action {
            Action::Flip {
                insert,
                update,
                delete,
            } => {
                granted = Privileges {
                    select: true,
                    insert,
                    update,
                    delete,
                };
                h.backend
                    .grant(&users(), "editor", granted)
                    .await
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                continue;
            }
            Action::Refresh => {
                h.gate
                    .refresh(&creds, &cancel)
                    .await
                    .map_err(|err| TestCaseError::fail(format!("refresh: {err}")))?;
                cached = granted;
                continue;
            }
            Action::Update { id, value } => OpRequest::UpdateCell {
                row: primary(id),
                column: "name".to_string(),
                old_value: model.get(&id).map(|name| json!(name)).unwrap_or(Value::Null),
                new_value: json!(format!("v{value}")),
            },
            Action::Delete { id } => OpRequest::DeleteRow { row: primary(id) },
            Action::Insert => OpRequest::InsertRow {
                values: BTreeMap::from([
                    ("id".to_string(), json!(next_insert)),
                    ("name".to_string(), json!(format!("n{next_insert}"))),
                ]),
            },
        };
        let operation = request.operation();
        let applied = request.clone();
        match h.manager.stage(&creds, &id, request, &cancel).await {
            Ok(op) => {
                prop_assert!(
                    cached.allows(operation),
                    "{operation} staged while the cached view denied it"
                );
                prop_assert_eq!(op.change.operation(), operation);
                staged_ops.push(operation);
                match applied {
                    OpRequest::UpdateCell { row, new_value, .. } => {
                        if let RowKey::Primary(key) = row {
                            let id = key["id"].as_i64().unwrap_or_default();
                            model.insert(id, new_value.as_str().unwrap_or_default().to_string());
                        }
                    }
                    OpRequest::DeleteRow { row } => {
                        if let RowKey::Primary(key) = row {
                            model.remove(&key["id"].as_i64().unwrap_or_default());
                        }
                    }
                    OpRequest::InsertRow { .. } => {
                        model.insert(next_insert, format!("n{next_insert}"));
                        next_insert += 1;
                    }
                }
            }
            Err(err) if !cached.allows(operation) => {
                prop_assert_eq!(err.kind, ErrorKind::GateDenied);
            }
            Err(err) => {
                // Log shapes collapse refuses, e.g. an edit after a delete.
                prop_assert_eq!(err.kind, ErrorKind::Validation);
            }
        }
    }

    h.gate
        .refresh(&creds, &cancel)
        .await
        .map_err(|err| TestCaseError::fail(format!("refresh: {err}")))?;
    let allowed = staged_ops.iter().all(|op| granted.allows(*op));

    if commit {
        match h.manager.commit(&creds, &id, &cancel).await {
            Ok(view) => {
                prop_assert!(allowed, "commit passed a revoked privilege");
                prop_assert_eq!(view.state, TxState::Committed);
                prop_assert_eq!(table_state(&h.backend).await, model);
            }
            Err(err) => {
                prop_assert!(!allowed, "commit failed unexpectedly: {}", err);
                prop_assert_eq!(err.kind, ErrorKind::GateDenied);
                prop_assert_eq!(table_state(&h.backend).await, before);
                let view = h
                    .manager
                    .get(&creds, &id)
                    .await
                    .map_err(|err| TestCaseError::fail(err.to_string()))?;
                prop_assert_eq!(view.state, TxState::Active);
                prop_assert_eq!(view.ops.len(), staged_ops.len());
            }
        }
    } else {
        let view = h
            .manager
            .rollback(&creds, &id)
            .await
            .map_err(|err| TestCaseError::fail(err.to_string()))?;
        prop_assert_eq!(view.state, TxState::RolledBack);
        prop_assert_eq!(table_state(&h.backend).await, before);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn staging_follows_the_gate_and_commit_applies_the_collapsed_log(
        actions in prop::collection::vec(action(), 0..24),
        commit in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(run_session(actions, commit))?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_leave_one_active_transaction() {
    let h = harness(Duration::from_secs(300)).await;
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = h.manager.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .start(&editor(), users(), &CancellationToken::new())
                .await
        }));
    }
    let mut started = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => started += 1,
            Err(err) => assert_eq!(err.kind, ErrorKind::Conflict),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(h.manager.len(), 1);
}

#[tokio::test]
async fn commit_succeeds_just_before_the_deadline() {
    let h = harness(Duration::from_secs(60)).await;
    let cancel = CancellationToken::new();
    let view = h.manager.start(&editor(), users(), &cancel).await.expect("start");
    h.manager
        .stage(
            &editor(),
            &view.id,
            OpRequest::DeleteRow { row: primary(2) },
            &cancel,
        )
        .await
        .expect("stage");
    h.clock.advance(Duration::from_millis(59_999));
    let committed = h
        .manager
        .commit(&editor(), &view.id, &cancel)
        .await
        .expect("commit");
    assert_eq!(committed.state, TxState::Committed);
    assert!(!table_state(&h.backend).await.contains_key(&2));
}

#[tokio::test]
async fn commit_after_the_deadline_is_expired_and_frees_staging() {
    let h = harness(Duration::from_secs(60)).await;
    let cancel = CancellationToken::new();
    let view = h.manager.start(&editor(), users(), &cancel).await.expect("start");
    h.manager
        .stage(
            &editor(),
            &view.id,
            OpRequest::DeleteRow { row: primary(2) },
            &cancel,
        )
        .await
        .expect("stage");
    h.clock.advance(Duration::from_millis(60_001));
    let err = h
        .manager
        .commit(&editor(), &view.id, &cancel)
        .await
        .expect_err("expired");
    assert_eq!(err.kind, ErrorKind::Expired);
    let view = h.manager.get(&editor(), &view.id).await.expect("get");
    assert_eq!(view.state, TxState::Expired);
    assert!(view.ops.is_empty());
    assert_eq!(table_state(&h.backend).await.len(), SEED_ROWS as usize);

    // A new transaction may start once the old one expired.
    h.manager
        .start(&editor(), users(), &cancel)
        .await
        .expect("restart");
}

#[tokio::test]
async fn reaper_drops_terminal_transactions_after_grace() {
    let h = harness(Duration::from_secs(60)).await;
    let cancel = CancellationToken::new();
    let view = h.manager.start(&editor(), users(), &cancel).await.expect("start");
    h.manager.rollback(&editor(), &view.id).await.expect("rollback");
    assert_eq!(h.manager.reap().await, 0);
    h.clock.advance(Duration::from_secs(61));
    assert_eq!(h.manager.reap().await, 1);
    let err = h
        .manager
        .get(&editor(), &view.id)
        .await
        .expect_err("reaped");
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn other_users_transactions_are_not_found() {
    let h = harness(Duration::from_secs(60)).await;
    h.backend.add_role("mallory", "x").await;
    h.backend
        .grant(&users(), "mallory", Privileges::all())
        .await
        .expect("grant");
    let cancel = CancellationToken::new();
    let view = h.manager.start(&editor(), users(), &cancel).await.expect("start");
    let err = h
        .manager
        .rollback(&Credentials::new("mallory", "x"), &view.id)
        .await
        .expect_err("foreign");
    assert_eq!(err.kind, ErrorKind::NotFound);
}
