//! Postgres implementation of the database backend.
//!
//! # Purpose
//! Opens connections authenticated as the end user's own role, so Postgres
//! itself enforces every privilege. Connections come from `sqlx` pools
//! partitioned by (role, database, password digest); a pool is never shared
//! between roles.
//!
//! # Security model
//! - Passwords live only inside `PgConnectOptions` and the pool key digest;
//!   they are never logged.
//! - Error text from Postgres is carried in [`BackendError`] for logs and is
//!   not forwarded to clients by the layers above.
//!
//! # Parameters and values
//! Parameters are bound by JSON type (integer, float, bool, text, json, or a
//! typed NULL). Generated statements wrap each parameter in
//! `CAST($n AS <catalog type>)`. Result cells are decoded into JSON values by
//! column type; types without a JSON mapping are rendered as `<typename>`.
use crate::backend::{
    Backend, BackendError, BackendResult, CellValue, Connection, Credentials, RowWindow, Rows,
};
use crate::sql::returns_rows;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::TryStreamExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo, ValueRef};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub default_database: String,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub per_role_max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    role: String,
    database: String,
    secret: [u8; 32],
}

pub struct PostgresBackend {
    settings: PostgresSettings,
    pools: DashMap<PoolKey, PgPool>,
}

impl PostgresBackend {
    pub fn new(settings: PostgresSettings) -> Self {
        Self {
            settings,
            pools: DashMap::new(),
        }
    }

    fn pool_for(&self, credentials: &Credentials, database: &str) -> (PoolKey, PgPool) {
        let key = PoolKey {
            role: credentials.role.clone(),
            database: database.to_string(),
            secret: Sha256::digest(credentials.password.as_bytes()).into(),
        };
        let pool = self
            .pools
            .entry(key.clone())
            .or_insert_with(|| {
                let options = PgConnectOptions::new()
                    .host(&self.settings.host)
                    .port(self.settings.port)
                    .username(&credentials.role)
                    .password(&credentials.password)
                    .database(database)
                    .application_name("dbconsole");
                // Lazy: the first acquire performs authentication, so a bad
                // password surfaces from `open` rather than here.
                PgPoolOptions::new()
                    .max_connections(self.settings.per_role_max.max(1))
                    .min_connections(0)
                    .acquire_timeout(self.settings.acquire_timeout)
                    .idle_timeout(Some(self.settings.idle_timeout))
                    .connect_lazy_with(options)
            })
            .clone();
        (key, pool)
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn open(
        &self,
        credentials: &Credentials,
        database: Option<&str>,
    ) -> BackendResult<Box<dyn Connection>> {
        let database = database.unwrap_or(&self.settings.default_database);
        let (key, pool) = self.pool_for(credentials, database);
        match pool.acquire().await {
            Ok(conn) => Ok(Box::new(PostgresConnection {
                conn: Some(conn),
                role: credentials.role.clone(),
                database: database.to_string(),
                in_transaction: false,
            })),
            Err(err) => {
                let mapped = map_error(err);
                if mapped == BackendError::AuthFailed {
                    // Do not keep pools for credentials Postgres rejected.
                    if let Some((_, pool)) = self.pools.remove(&key) {
                        pool.close().await;
                    }
                }
                Err(mapped)
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

pub struct PostgresConnection {
    conn: Option<PoolConnection<Postgres>>,
    role: String,
    database: String,
    in_transaction: bool,
}

impl PostgresConnection {
    fn live(&mut self) -> BackendResult<&mut PoolConnection<Postgres>> {
        self.conn
            .as_mut()
            .ok_or_else(|| BackendError::Unavailable("connection already released".to_string()))
    }

    async fn simple(&mut self, sql: &'static str) -> BackendResult<()> {
        let conn = self.live()?;
        sqlx::query(sql)
            .execute(&mut **conn)
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn role(&self) -> &str {
        &self.role
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&mut self, sql: &str, params: &[CellValue]) -> BackendResult<Rows> {
        let conn = self.live()?;
        let query = bind_all(sqlx::query(sql), params);
        if returns_rows(sql) {
            let rows = query.fetch_all(&mut **conn).await.map_err(map_error)?;
            let mut result = Rows {
                columns: column_names(rows.first()),
                ..Rows::default()
            };
            for row in &rows {
                result.rows.push(decode_row(row));
            }
            result.total = result.rows.len() as u64;
            result.rows_affected = result.total;
            return Ok(result);
        }
        let done = query.execute(&mut **conn).await.map_err(map_error)?;
        Ok(Rows {
            rows_affected: done.rows_affected(),
            ..Rows::default()
        })
    }

    async fn fetch_window(
        &mut self,
        sql: &str,
        params: &[CellValue],
        window: RowWindow,
    ) -> BackendResult<Rows> {
        let conn = self.live()?;
        let mut stream = bind_all(sqlx::query(sql), params).fetch(&mut **conn);
        let mut result = Rows::default();
        let end = window.offset.saturating_add(window.limit);
        while let Some(row) = stream.try_next().await.map_err(map_error)? {
            if result.total == 0 {
                result.columns = column_names(Some(&row));
            }
            if result.total >= window.offset && result.total < end {
                result.rows.push(decode_row(&row));
            }
            result.total += 1;
        }
        Ok(result)
    }

    async fn begin_tx(&mut self) -> BackendResult<()> {
        self.simple("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_tx(&mut self) -> BackendResult<()> {
        let outcome = self.simple("COMMIT").await;
        self.in_transaction = false;
        outcome
    }

    async fn rollback_tx(&mut self) -> BackendResult<()> {
        // A failed ROLLBACK leaves `in_transaction` set so `release` discards.
        self.simple("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    fn release(&mut self) {
        if self.in_transaction {
            // Never hand a connection with an open transaction back to the pool.
            self.discard();
        } else {
            self.conn.take();
        }
    }

    fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
        self.in_transaction = false;
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[CellValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(flag) => query.bind(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => query.bind(integer),
                None => query.bind(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => query.bind(text.clone()),
            other => query.bind(other.clone()),
        };
    }
    query
}

fn column_names(row: Option<&PgRow>) -> Vec<String> {
    row.map(|row| {
        row.columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect()
    })
    .unwrap_or_default()
}

fn decode_row(row: &PgRow) -> Vec<CellValue> {
    (0..row.columns().len())
        .map(|index| decode_cell(row, index))
        .collect()
}

fn decode_cell(row: &PgRow, index: usize) -> CellValue {
    let type_name = row.columns()[index].type_info().name().to_string();
    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map(|v| v.map(Value::from)),
        "INT2" => row.try_get::<Option<i16>, _>(index).map(|v| v.map(Value::from)),
        "INT4" => row.try_get::<Option<i32>, _>(index).map(|v| v.map(Value::from)),
        "INT8" => row.try_get::<Option<i64>, _>(index).map(|v| v.map(Value::from)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index).map(|v| v.map(Value::from)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(|v| v.map(Value::from)),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" | "UNKNOWN" => {
            row.try_get::<Option<String>, _>(index).map(|v| v.map(Value::from))
        }
        // No JSON mapping: keep NULL visible, mark the rest.
        _ => row.try_get_raw(index).map(|raw| {
            (!raw.is_null()).then(|| Value::String(format!("<{}>", type_name.to_lowercase())))
        }),
    };
    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(err) => {
            tracing::debug!(column = index, type_name = %type_name, error = %err, "cell decode failed");
            Value::String(format!("<{}>", type_name.to_lowercase()))
        }
    }
}

pub(crate) fn map_error(err: sqlx::Error) -> BackendError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|code| code.to_string()).unwrap_or_default();
            match code.as_str() {
                "28P01" | "28000" => BackendError::AuthFailed,
                "42501" => BackendError::Denied(db_err.message().to_string()),
                "57014" => BackendError::Canceled,
                code if code.starts_with("08") || code.starts_with("53") || code == "57P01" => {
                    BackendError::Unavailable(db_err.message().to_string())
                }
                _ => BackendError::Query(db_err.message().to_string()),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => BackendError::Unavailable(err.to_string()),
        _ => BackendError::Query(err.to_string()),
    }
}
