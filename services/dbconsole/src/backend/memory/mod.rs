//! In-memory implementation of the database backend.
//!
//! # Purpose
//! A small relational engine that lets the console run end to end without a
//! database server. It exists for:
//! - local development (`backend: memory`, optionally seeded from YAML)
//! - tests that need to provoke backend-side behavior: revoking a grant
//!   after the access cache was filled, deleting a row underneath a staged
//!   update, failing a login
//!
//! # Model
//! Roles with passwords; databases -> schemas -> tables, each table carrying
//! columns, a primary key, foreign keys, per-role grants and rows. The catalog
//! queries issued by the probe are answered from this model, and the
//! canonical statement shapes are executed by [`engine`].
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - Autocommit statements run under the write lock.
//! - `BEGIN` snapshots the connection's database into a private working copy;
//!   `COMMIT` swaps it back in whole, `ROLLBACK` drops it. Concurrent writers
//!   are not merged; the last commit wins.
use crate::access::probe::{
    COLUMNS_SQL, FOREIGN_KEYS_SQL, LIST_DATABASES_SQL, PRIMARY_KEYS_SQL, TABLE_PRIVILEGES_SQL,
};
use crate::access::{Privileges, TableRef};
use crate::backend::{
    Backend, BackendError, BackendResult, CellValue, Connection, Credentials, Rows,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod engine;
pub mod parse;

pub use engine::{ColumnDef, DatabaseDef, ForeignKeyDef, TableDef};
use engine::Outcome;

/// Complete engine state; also the shape of a YAML seed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFixture {
    /// role -> password
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseDef>,
}

impl MemoryFixture {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryFixture>>,
    default_database: String,
}

impl MemoryBackend {
    pub fn new(default_database: impl Into<String>) -> Self {
        Self::from_fixture(MemoryFixture::default(), default_database)
    }

    pub fn from_fixture(mut fixture: MemoryFixture, default_database: impl Into<String>) -> Self {
        let default_database = default_database.into();
        fixture
            .databases
            .entry(default_database.clone())
            .or_default();
        Self {
            state: Arc::new(RwLock::new(fixture)),
            default_database,
        }
    }

    pub fn default_database(&self) -> &str {
        &self.default_database
    }

    pub async fn add_role(&self, role: &str, password: &str) {
        self.state
            .write()
            .await
            .roles
            .insert(role.to_string(), password.to_string());
    }

    pub async fn create_table(&self, target: &TableRef, table: TableDef) {
        self.state
            .write()
            .await
            .databases
            .entry(target.database.clone())
            .or_default()
            .schemas
            .entry(target.schema.clone())
            .or_default()
            .insert(target.table.clone(), table);
    }

    pub async fn grant(
        &self,
        target: &TableRef,
        role: &str,
        privileges: Privileges,
    ) -> BackendResult<()> {
        self.with_table(target, |table| {
            table.grants.insert(role.to_string(), privileges);
        })
        .await
    }

    pub async fn revoke(&self, target: &TableRef, role: &str) -> BackendResult<()> {
        self.with_table(target, |table| {
            table.grants.remove(role);
        })
        .await
    }

    pub async fn insert_rows(
        &self,
        target: &TableRef,
        rows: Vec<Vec<CellValue>>,
    ) -> BackendResult<()> {
        self.with_table(target, |table| table.rows.extend(rows))
            .await
    }

    /// Current rows of a table, bypassing privileges.
    pub async fn rows(&self, target: &TableRef) -> BackendResult<Vec<Vec<CellValue>>> {
        self.with_table(target, |table| table.rows.clone()).await
    }

    /// Delete rows whose `column` equals `value`, bypassing privileges.
    pub async fn delete_where(
        &self,
        target: &TableRef,
        column: &str,
        value: &CellValue,
    ) -> BackendResult<usize> {
        self.with_table(target, |table| {
            let Some(index) = table.columns.iter().position(|c| c.name == column) else {
                return 0;
            };
            let before = table.rows.len();
            table.rows.retain(|row| row.get(index) != Some(value));
            before - table.rows.len()
        })
        .await
    }

    async fn with_table<T>(
        &self,
        target: &TableRef,
        f: impl FnOnce(&mut TableDef) -> T,
    ) -> BackendResult<T> {
        let mut state = self.state.write().await;
        let table = state
            .databases
            .get_mut(&target.database)
            .and_then(|db| db.schemas.get_mut(&target.schema))
            .and_then(|tables| tables.get_mut(&target.table))
            .ok_or_else(|| BackendError::Query(format!("relation {target} does not exist")))?;
        Ok(f(table))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open(
        &self,
        credentials: &Credentials,
        database: Option<&str>,
    ) -> BackendResult<Box<dyn Connection>> {
        let database = database.unwrap_or(&self.default_database).to_string();
        let state = self.state.read().await;
        match state.roles.get(&credentials.role) {
            Some(password) if *password == credentials.password => {}
            _ => return Err(BackendError::AuthFailed),
        }
        if !state.databases.contains_key(&database) {
            return Err(BackendError::Unavailable(format!(
                "database \"{database}\" does not exist"
            )));
        }
        drop(state);
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            role: credentials.role.clone(),
            database,
            working: None,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

pub struct MemoryConnection {
    state: Arc<RwLock<MemoryFixture>>,
    role: String,
    database: String,
    /// Private copy of the database while a transaction is open.
    working: Option<DatabaseDef>,
}

impl MemoryConnection {
    fn missing_database(&self) -> BackendError {
        BackendError::Unavailable(format!("database \"{}\" does not exist", self.database))
    }

    async fn catalog(&self, sql: &str, params: &[CellValue]) -> BackendResult<Option<Rows>> {
        if sql == LIST_DATABASES_SQL {
            let state = self.state.read().await;
            let rows = state
                .databases
                .keys()
                .map(|name| vec![Value::String(name.clone())])
                .collect();
            return Ok(Some(rows_of(&["datname"], rows)));
        }
        let known = [
            TABLE_PRIVILEGES_SQL,
            COLUMNS_SQL,
            PRIMARY_KEYS_SQL,
            FOREIGN_KEYS_SQL,
        ];
        if !known.contains(&sql) {
            return Ok(None);
        }
        let db = match &self.working {
            Some(working) => working.clone(),
            None => self
                .state
                .read()
                .await
                .databases
                .get(&self.database)
                .cloned()
                .ok_or_else(|| self.missing_database())?,
        };
        let mut rows = Vec::new();
        if sql == TABLE_PRIVILEGES_SQL {
            let role = params
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::Query("there is no parameter $1".to_string()))?;
            for (schema, tables) in &db.schemas {
                let usage = tables
                    .values()
                    .any(|table| table.privileges_for(role).any());
                if !usage {
                    continue;
                }
                for (name, table) in tables {
                    let bits = table.privileges_for(role);
                    rows.push(vec![
                        text(schema),
                        text(name),
                        Value::Bool(bits.select),
                        Value::Bool(bits.insert),
                        Value::Bool(bits.update),
                        Value::Bool(bits.delete),
                    ]);
                }
            }
            return Ok(Some(rows_of(
                &[
                    "table_schema",
                    "table_name",
                    "can_select",
                    "can_insert",
                    "can_update",
                    "can_delete",
                ],
                rows,
            )));
        }
        if sql == COLUMNS_SQL {
            for (schema, tables) in &db.schemas {
                for (name, table) in tables {
                    for column in &table.columns {
                        rows.push(vec![
                            text(schema),
                            text(name),
                            text(&column.name),
                            text(&column.data_type),
                            Value::Bool(column.nullable && !table.primary_key.contains(&column.name)),
                        ]);
                    }
                }
            }
            return Ok(Some(rows_of(
                &["table_schema", "table_name", "column_name", "data_type", "nullable"],
                rows,
            )));
        }
        if sql == PRIMARY_KEYS_SQL {
            for (schema, tables) in &db.schemas {
                for (name, table) in tables {
                    for column in &table.primary_key {
                        rows.push(vec![text(schema), text(name), text(column)]);
                    }
                }
            }
            return Ok(Some(rows_of(
                &["table_schema", "table_name", "column_name"],
                rows,
            )));
        }
        for (schema, tables) in &db.schemas {
            for (name, table) in tables {
                for fk in &table.foreign_keys {
                    for (column, referenced) in fk.columns.iter().zip(&fk.referenced_columns) {
                        rows.push(vec![
                            text(&fk.name),
                            text(schema),
                            text(name),
                            text(column),
                            text(&fk.referenced_schema),
                            text(&fk.referenced_table),
                            text(referenced),
                        ]);
                    }
                }
            }
        }
        Ok(Some(rows_of(
            &[
                "constraint_name",
                "table_schema",
                "table_name",
                "column_name",
                "referenced_schema",
                "referenced_table",
                "referenced_column",
            ],
            rows,
        )))
    }
}

fn text(value: &str) -> CellValue {
    Value::String(value.to_string())
}

fn rows_of(columns: &[&str], rows: Vec<Vec<CellValue>>) -> Rows {
    Rows {
        columns: columns.iter().map(|column| column.to_string()).collect(),
        total: rows.len() as u64,
        rows,
        rows_affected: 0,
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn role(&self) -> &str {
        &self.role
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&mut self, sql: &str, params: &[CellValue]) -> BackendResult<Rows> {
        if let Some(rows) = self.catalog(sql, params).await? {
            return Ok(rows);
        }
        let stmt = parse::parse(sql)?;
        let outcome = match self.working.as_mut() {
            Some(working) => engine::run(working, &self.role, stmt, params)?,
            None => {
                let mut state = self.state.write().await;
                let db = state
                    .databases
                    .get_mut(&self.database)
                    .ok_or_else(|| self.missing_database())?;
                engine::run(db, &self.role, stmt, params)?
            }
        };
        match outcome {
            Outcome::Rows(rows) => Ok(rows),
            Outcome::Begin => self.begin_tx().await.map(|_| Rows::default()),
            Outcome::Commit => self.commit_tx().await.map(|_| Rows::default()),
            Outcome::Rollback => self.rollback_tx().await.map(|_| Rows::default()),
        }
    }

    async fn begin_tx(&mut self) -> BackendResult<()> {
        if self.working.is_some() {
            return Ok(());
        }
        let snapshot = self
            .state
            .read()
            .await
            .databases
            .get(&self.database)
            .cloned()
            .ok_or_else(|| self.missing_database())?;
        self.working = Some(snapshot);
        Ok(())
    }

    async fn commit_tx(&mut self) -> BackendResult<()> {
        if let Some(working) = self.working.take() {
            self.state
                .write()
                .await
                .databases
                .insert(self.database.clone(), working);
        }
        Ok(())
    }

    async fn rollback_tx(&mut self) -> BackendResult<()> {
        self.working = None;
        Ok(())
    }

    fn release(&mut self) {
        self.working = None;
    }

    fn discard(&mut self) {
        self.working = None;
    }
}
