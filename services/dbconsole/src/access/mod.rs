//! Per-role view of the database catalog.
//!
//! # Purpose
//! A [`RoleAccess`] is the closed-world enumeration of what one role can see:
//! databases, schemas, tables (each with columns, primary key, privilege bits
//! and foreign keys). It is produced by [`probe`], held by [`cache`], and
//! consulted by [`gate`] before anything is buffered or executed.
//!
//! # Key invariants
//! - Every listed table carries at least the SELECT bit.
//! - A `RoleAccess` is never mutated after construction; refresh replaces it.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;

pub mod cache;
pub mod gate;
pub mod probe;

/// Fully qualified table address.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub struct TableRef {
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.schema, self.table)
    }
}

/// The four table privileges the console cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Select => "SELECT",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct Privileges {
    #[serde(rename = "S")]
    pub select: bool,
    #[serde(rename = "I")]
    pub insert: bool,
    #[serde(rename = "U")]
    pub update: bool,
    #[serde(rename = "D")]
    pub delete: bool,
}

impl Privileges {
    pub fn read_only() -> Self {
        Self {
            select: true,
            ..Self::default()
        }
    }

    pub fn all() -> Self {
        Self {
            select: true,
            insert: true,
            update: true,
            delete: true,
        }
    }

    pub fn allows(&self, op: Operation) -> bool {
        match op {
            Operation::Select => self.select,
            Operation::Insert => self.insert,
            Operation::Update => self.update,
            Operation::Delete => self.delete,
        }
    }

    pub fn any(&self) -> bool {
        self.select || self.insert || self.update || self.delete
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ColumnInfo {
    pub name: String,
    /// SQL type as reported by the catalog (e.g. `integer`, `text`).
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced: TableRef,
    pub referenced_columns: Vec<String>,
    /// The referenced table is not visible to this role. Navigation must show
    /// a "not visible" sentinel instead of fetching the parent row.
    pub opaque: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TableAccess {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub privileges: Privileges,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableAccess {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SchemaAccess {
    pub tables: BTreeMap<String, TableAccess>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DatabaseAccess {
    pub schemas: BTreeMap<String, SchemaAccess>,
}

impl DatabaseAccess {
    pub fn is_empty(&self) -> bool {
        self.schemas.values().all(|schema| schema.tables.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RoleAccess {
    pub role: String,
    pub databases: BTreeMap<String, DatabaseAccess>,
}

impl RoleAccess {
    pub fn empty(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            databases: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.databases.values().all(DatabaseAccess::is_empty)
    }

    pub fn database_names(&self) -> Vec<&str> {
        self.databases.keys().map(String::as_str).collect()
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.databases.contains_key(database)
    }

    pub fn has_schema(&self, database: &str, schema: &str) -> bool {
        self.databases
            .get(database)
            .is_some_and(|db| db.schemas.contains_key(schema))
    }

    pub fn table(&self, target: &TableRef) -> Option<&TableAccess> {
        self.databases
            .get(&target.database)?
            .schemas
            .get(&target.schema)?
            .tables
            .get(&target.table)
    }

    /// Stateless predicate: may this role perform `op` on `target`?
    pub fn permits(&self, op: Operation, target: &TableRef) -> bool {
        self.table(target)
            .is_some_and(|table| table.privileges.allows(op))
    }

    /// Every foreign-key edge, keyed by the referencing table.
    pub fn foreign_key_graph(&self) -> Vec<(TableRef, &ForeignKey)> {
        let mut edges = Vec::new();
        for (db_name, db) in &self.databases {
            for (schema_name, schema) in &db.schemas {
                for (table_name, table) in &schema.tables {
                    for fk in &table.foreign_keys {
                        edges.push((TableRef::new(db_name, schema_name, table_name), fk));
                    }
                }
            }
        }
        edges
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn users_table(privileges: Privileges) -> TableAccess {
        TableAccess {
            name: "users".to_string(),
            columns: vec![
                ColumnInfo {
                    name: "id".to_string(),
                    data_type: "integer".to_string(),
                    nullable: false,
                },
                ColumnInfo {
                    name: "name".to_string(),
                    data_type: "text".to_string(),
                    nullable: true,
                },
            ],
            primary_key: vec!["id".to_string()],
            privileges,
            foreign_keys: Vec::new(),
        }
    }

    pub fn access_with(role: &str, table: TableAccess) -> RoleAccess {
        let mut schema = SchemaAccess::default();
        schema.tables.insert(table.name.clone(), table);
        let mut db = DatabaseAccess::default();
        db.schemas.insert("public".to_string(), schema);
        let mut access = RoleAccess::empty(role);
        access.databases.insert("testdb".to_string(), db);
        access
    }
}
