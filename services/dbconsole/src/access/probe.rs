//! Catalog probe.
//!
//! # Purpose
//! Runs a fixed, bounded set of catalog queries over a connection that is
//! already authenticated as the role being probed, so the database itself
//! decides what is visible. The result is the closed-world [`DatabaseAccess`]
//! for that connection's database.
//!
//! # Key invariants
//! - Tables without SELECT are dropped from the result.
//! - Foreign keys whose referenced table is not in the result are kept and
//!   flagged `opaque`.
//! - The probe is read-only and idempotent.
use crate::access::{
    ColumnInfo, DatabaseAccess, ForeignKey, Privileges, RoleAccess, SchemaAccess, TableAccess,
    TableRef,
};
use crate::backend::{BackendError, CellValue, Connection, Rows};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub const LIST_DATABASES_SQL: &str = "SELECT datname FROM pg_database \
WHERE datallowconn AND NOT datistemplate AND has_database_privilege(datname, 'CONNECT') \
ORDER BY datname";

/// `$1` is the role name.
pub const TABLE_PRIVILEGES_SQL: &str = "SELECT n.nspname AS table_schema, c.relname AS table_name, \
has_table_privilege($1::name, c.oid, 'SELECT') AS can_select, \
has_table_privilege($1::name, c.oid, 'INSERT') AS can_insert, \
has_table_privilege($1::name, c.oid, 'UPDATE') AS can_update, \
has_table_privilege($1::name, c.oid, 'DELETE') AS can_delete \
FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
WHERE c.relkind IN ('r', 'p', 'v') \
AND n.nspname NOT IN ('pg_catalog', 'information_schema') AND n.nspname NOT LIKE 'pg_toast%' \
AND has_schema_privilege($1::name, n.oid, 'USAGE') \
ORDER BY 1, 2";

pub const COLUMNS_SQL: &str = "SELECT n.nspname AS table_schema, c.relname AS table_name, \
a.attname AS column_name, format_type(a.atttypid, a.atttypmod) AS data_type, \
NOT a.attnotnull AS nullable \
FROM pg_attribute a JOIN pg_class c ON c.oid = a.attrelid \
JOIN pg_namespace n ON n.oid = c.relnamespace \
WHERE a.attnum > 0 AND NOT a.attisdropped AND c.relkind IN ('r', 'p', 'v') \
AND n.nspname NOT IN ('pg_catalog', 'information_schema') AND n.nspname NOT LIKE 'pg_toast%' \
ORDER BY 1, 2, a.attnum";

pub const PRIMARY_KEYS_SQL: &str = "SELECT n.nspname AS table_schema, c.relname AS table_name, \
a.attname AS column_name \
FROM pg_index i JOIN pg_class c ON c.oid = i.indrelid \
JOIN pg_namespace n ON n.oid = c.relnamespace \
JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord) ON true \
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum \
WHERE i.indisprimary AND n.nspname NOT IN ('pg_catalog', 'information_schema') \
ORDER BY 1, 2, k.ord";

pub const FOREIGN_KEYS_SQL: &str = "SELECT con.conname AS constraint_name, \
sn.nspname AS table_schema, sc.relname AS table_name, sa.attname AS column_name, \
tn.nspname AS referenced_schema, tc.relname AS referenced_table, ta.attname AS referenced_column \
FROM pg_constraint con \
JOIN pg_class sc ON sc.oid = con.conrelid JOIN pg_namespace sn ON sn.oid = sc.relnamespace \
JOIN pg_class tc ON tc.oid = con.confrelid JOIN pg_namespace tn ON tn.oid = tc.relnamespace \
JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(src, dst, ord) ON true \
JOIN pg_attribute sa ON sa.attrelid = con.conrelid AND sa.attnum = k.src \
JOIN pg_attribute ta ON ta.attrelid = con.confrelid AND ta.attnum = k.dst \
WHERE con.contype = 'f' AND sn.nspname NOT IN ('pg_catalog', 'information_schema') \
ORDER BY 1, 2, 3, k.ord";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("malformed catalog row: {0}")]
    Malformed(String),
}

impl From<ProbeError> for crate::error::ConsoleError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Backend(err) => err.into(),
            ProbeError::Malformed(detail) => {
                crate::error::ConsoleError::internal("catalog probe returned an unexpected shape")
                    .with_detail(detail)
            }
        }
    }
}

/// Databases the connection's role may connect to, in name order.
pub async fn list_databases(conn: &mut dyn Connection) -> Result<Vec<String>, ProbeError> {
    let rows = conn.execute(LIST_DATABASES_SQL, &[]).await?;
    rows.rows
        .iter()
        .map(|row| text_at(row, 0, "datname"))
        .collect()
}

/// Probe only the connection's current database and wrap it as a
/// single-database [`RoleAccess`].
pub async fn probe(conn: &mut dyn Connection, role: &str) -> Result<RoleAccess, ProbeError> {
    let database = conn.database().to_string();
    let access = probe_database(conn, role).await?;
    let mut result = RoleAccess::empty(role);
    if !access.is_empty() {
        result.databases.insert(database, access);
    }
    Ok(result)
}

/// Enumerate schemas, tables, columns, keys and privileges visible to `role`
/// in the connection's current database.
pub async fn probe_database(
    conn: &mut dyn Connection,
    role: &str,
) -> Result<DatabaseAccess, ProbeError> {
    let database = conn.database().to_string();
    let role_param = [CellValue::String(role.to_string())];

    // Step 1: privileges decide which tables exist at all.
    let privileges = conn.execute(TABLE_PRIVILEGES_SQL, &role_param).await?;
    let mut tables: BTreeMap<(String, String), TableAccess> = BTreeMap::new();
    for row in &privileges.rows {
        let schema = text_at(row, 0, "table_schema")?;
        let table = text_at(row, 1, "table_name")?;
        let bits = Privileges {
            select: flag_at(row, 2, "can_select")?,
            insert: flag_at(row, 3, "can_insert")?,
            update: flag_at(row, 4, "can_update")?,
            delete: flag_at(row, 5, "can_delete")?,
        };
        if !bits.select {
            continue;
        }
        tables.insert(
            (schema, table.clone()),
            TableAccess {
                name: table,
                columns: Vec::new(),
                primary_key: Vec::new(),
                privileges: bits,
                foreign_keys: Vec::new(),
            },
        );
    }
    if tables.is_empty() {
        return Ok(DatabaseAccess::default());
    }

    // Step 2: columns and primary keys for the surviving tables only.
    let columns = conn.execute(COLUMNS_SQL, &[]).await?;
    for row in &columns.rows {
        let key = (text_at(row, 0, "table_schema")?, text_at(row, 1, "table_name")?);
        if let Some(table) = tables.get_mut(&key) {
            table.columns.push(ColumnInfo {
                name: text_at(row, 2, "column_name")?,
                data_type: text_at(row, 3, "data_type")?,
                nullable: flag_at(row, 4, "nullable")?,
            });
        }
    }
    let keys = conn.execute(PRIMARY_KEYS_SQL, &[]).await?;
    for row in &keys.rows {
        let key = (text_at(row, 0, "table_schema")?, text_at(row, 1, "table_name")?);
        if let Some(table) = tables.get_mut(&key) {
            table.primary_key.push(text_at(row, 2, "column_name")?);
        }
    }

    // Step 3: foreign keys, grouped by constraint and flagged opaque when the
    // parent table did not survive step 1.
    let fks = conn.execute(FOREIGN_KEYS_SQL, &[]).await?;
    let edges = group_foreign_keys(&database, &fks)?;
    for ((schema, table), mut fk) in edges {
        fk.opaque = !tables.contains_key(&(
            fk.referenced.schema.clone(),
            fk.referenced.table.clone(),
        ));
        if let Some(owner) = tables.get_mut(&(schema, table)) {
            owner.foreign_keys.push(fk);
        }
    }

    let mut access = DatabaseAccess::default();
    for ((schema, name), table) in tables {
        access
            .schemas
            .entry(schema)
            .or_insert_with(SchemaAccess::default)
            .tables
            .insert(name, table);
    }
    Ok(access)
}

fn group_foreign_keys(
    database: &str,
    rows: &Rows,
) -> Result<Vec<((String, String), ForeignKey)>, ProbeError> {
    let mut order: Vec<(String, String, String)> = Vec::new();
    let mut grouped: HashMap<(String, String, String), ForeignKey> = HashMap::new();
    for row in &rows.rows {
        let name = text_at(row, 0, "constraint_name")?;
        let schema = text_at(row, 1, "table_schema")?;
        let table = text_at(row, 2, "table_name")?;
        let column = text_at(row, 3, "column_name")?;
        let referenced = TableRef::new(
            database,
            text_at(row, 4, "referenced_schema")?,
            text_at(row, 5, "referenced_table")?,
        );
        let referenced_column = text_at(row, 6, "referenced_column")?;
        let key = (schema, table, name.clone());
        let entry = grouped.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            ForeignKey {
                name,
                columns: Vec::new(),
                referenced,
                referenced_columns: Vec::new(),
                opaque: false,
            }
        });
        entry.columns.push(column);
        entry.referenced_columns.push(referenced_column);
    }
    Ok(order
        .into_iter()
        .filter_map(|key| {
            let fk = grouped.remove(&key)?;
            Some(((key.0, key.1), fk))
        })
        .collect())
}

fn text_at(row: &[CellValue], index: usize, name: &str) -> Result<String, ProbeError> {
    match row.get(index) {
        Some(Value::String(value)) => Ok(value.clone()),
        other => Err(ProbeError::Malformed(format!(
            "column {name} expected text, got {other:?}"
        ))),
    }
}

fn flag_at(row: &[CellValue], index: usize, name: &str) -> Result<bool, ProbeError> {
    match row.get(index) {
        Some(Value::Bool(value)) => Ok(*value),
        other => Err(ProbeError::Malformed(format!(
            "column {name} expected boolean, got {other:?}"
        ))),
    }
}
