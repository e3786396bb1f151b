//! Staged transactions.
//!
//! # Purpose
//! A console transaction is a server-side staging area, not a backend
//! transaction. Cell edits, inserts and deletes are appended to an ordered log
//! and only replayed, after the collapse rewrite, inside one backend
//! BEGIN/COMMIT when the user commits.
//!
//! # Key invariants
//! - At most one active transaction per user.
//! - The log is append-only while active; a later edit of the same cell is a
//!   new entry, merged only by [`collapse::collapse`] at commit time.
//! - Every entry targets the transaction's single table.
use crate::access::{Operation, TableAccess, TableRef};
use crate::backend::CellValue;
use crate::error::{ConsoleError, ConsoleResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;
use utoipa::ToSchema;

pub mod collapse;
pub mod manager;

pub use manager::{TransactionManager, TransactionPolicy};

/// Prefix of synthetic row keys handed out for staged inserts.
pub const STAGED_ROW_PREFIX: &str = "insert:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Active,
    Committing,
    Committed,
    RolledBack,
    Expired,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::Expired
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Active => "active",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
            TxState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// How a staged change addresses its row.
///
/// Serialized untagged: a synthetic key is a string (`"insert:3"`), a primary
/// key is an object of column to value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Staged(String),
    Primary(BTreeMap<String, CellValue>),
}

impl RowKey {
    pub fn staged(n: u64) -> Self {
        RowKey::Staged(format!("{STAGED_ROW_PREFIX}{n}"))
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, RowKey::Staged(_))
    }

    /// Stable text form used to group changes by row.
    pub fn identity(&self) -> String {
        match self {
            RowKey::Staged(key) => key.clone(),
            RowKey::Primary(columns) => {
                serde_json::to_string(columns).unwrap_or_else(|_| format!("{columns:?}"))
            }
        }
    }

    /// Key columns in primary key order.
    pub fn primary_columns(&self, table: &TableAccess) -> Vec<(String, CellValue)> {
        match self {
            RowKey::Staged(_) => Vec::new(),
            RowKey::Primary(columns) => table
                .primary_key
                .iter()
                .filter_map(|name| {
                    columns
                        .get(name)
                        .map(|value| (name.clone(), value.clone()))
                })
                .collect(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// One staging request as sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpRequest {
    UpdateCell {
        #[schema(value_type = Object)]
        row: RowKey,
        column: String,
        #[serde(default)]
        #[schema(value_type = Object)]
        old_value: CellValue,
        #[schema(value_type = Object)]
        new_value: CellValue,
    },
    DeleteRow {
        #[schema(value_type = Object)]
        row: RowKey,
    },
    InsertRow {
        #[serde(default)]
        #[schema(value_type = Object)]
        values: BTreeMap<String, CellValue>,
    },
}

impl OpRequest {
    pub fn operation(&self) -> Operation {
        match self {
            OpRequest::UpdateCell { .. } => Operation::Update,
            OpRequest::DeleteRow { .. } => Operation::Delete,
            OpRequest::InsertRow { .. } => Operation::Insert,
        }
    }
}

/// A change as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagedChange {
    UpdateCell {
        row: RowKey,
        column: String,
        old_value: CellValue,
        new_value: CellValue,
    },
    DeleteRow {
        row: RowKey,
    },
    InsertRow {
        row: RowKey,
        values: BTreeMap<String, CellValue>,
    },
}

impl StagedChange {
    pub fn operation(&self) -> Operation {
        match self {
            StagedChange::UpdateCell { .. } => Operation::Update,
            StagedChange::DeleteRow { .. } => Operation::Delete,
            StagedChange::InsertRow { .. } => Operation::Insert,
        }
    }

    pub fn row(&self) -> &RowKey {
        match self {
            StagedChange::UpdateCell { row, .. }
            | StagedChange::DeleteRow { row }
            | StagedChange::InsertRow { row, .. } => row,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedOp {
    pub seq: u64,
    #[serde(flatten)]
    pub change: StagedChange,
    #[serde(skip)]
    pub created_at: Instant,
}

/// Why the last commit attempt failed, and which entry caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CommitFailure {
    pub code: String,
    pub message: String,
    pub op_seq: Option<u64>,
}

impl CommitFailure {
    pub fn new(err: &ConsoleError, op_seq: Option<u64>) -> Self {
        Self {
            code: err.kind.code().to_string(),
            message: err.message.clone(),
            op_seq,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TransactionView {
    pub id: String,
    pub owner: String,
    pub target: TableRef,
    pub state: TxState,
    #[schema(value_type = Vec<Object>)]
    pub ops: Vec<StagedOp>,
    /// Milliseconds until the lease runs out; zero once terminal.
    pub expires_in_ms: u64,
    pub last_error: Option<CommitFailure>,
}

/// Shape checks for a change against the target table's catalog entry.
///
/// Primary keys must name exactly the table's key columns; staged keys must
/// look like `insert:<n>`; every column must exist.
pub(crate) fn validate_change(table: &TableAccess, request: &OpRequest) -> ConsoleResult<()> {
    match request {
        OpRequest::UpdateCell { row, column, .. } => {
            validate_row_key(table, row)?;
            if table.column(column).is_none() {
                return Err(ConsoleError::validation(format!("unknown column {column:?}")));
            }
            Ok(())
        }
        OpRequest::DeleteRow { row } => validate_row_key(table, row),
        OpRequest::InsertRow { values } => {
            for column in values.keys() {
                if table.column(column).is_none() {
                    return Err(ConsoleError::validation(format!(
                        "unknown column {column:?}"
                    )));
                }
            }
            Ok(())
        }
    }
}

/// Largest magnitude below which every integral `f64` is exact.
const EXACT_INTEGER_LIMIT: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumericFamily {
    Integer,
    Decimal,
}

fn numeric_family(data_type: &str) -> Option<NumericFamily> {
    let base = data_type
        .split('(')
        .next()
        .unwrap_or(data_type)
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" | "smallserial"
        | "serial" | "bigserial" => Some(NumericFamily::Integer),
        "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" => {
            Some(NumericFamily::Decimal)
        }
        _ => None,
    }
}

/// Bring primary key values into the one form changes are grouped by, so
/// `{"id": 7}`, `{"id": 7.0}` and `{"id": "7"}` address the same row of an
/// integer-keyed table. Non-numeric key columns are left untouched.
pub(crate) fn canonicalize(table: &TableAccess, request: OpRequest) -> ConsoleResult<OpRequest> {
    Ok(match request {
        OpRequest::UpdateCell {
            row,
            column,
            old_value,
            new_value,
        } => OpRequest::UpdateCell {
            row: canonical_row_key(table, row)?,
            column,
            old_value,
            new_value,
        },
        OpRequest::DeleteRow { row } => OpRequest::DeleteRow {
            row: canonical_row_key(table, row)?,
        },
        insert @ OpRequest::InsertRow { .. } => insert,
    })
}

fn canonical_row_key(table: &TableAccess, row: RowKey) -> ConsoleResult<RowKey> {
    match row {
        RowKey::Staged(_) => Ok(row),
        RowKey::Primary(columns) => columns
            .into_iter()
            .map(|(name, value)| {
                let family = table
                    .column(&name)
                    .and_then(|column| numeric_family(&column.data_type));
                let value = match family {
                    Some(family) => canonical_number(&name, family, value)?,
                    None => value,
                };
                Ok((name, value))
            })
            .collect::<ConsoleResult<BTreeMap<_, _>>>()
            .map(RowKey::Primary),
    }
}

fn canonical_number(
    column: &str,
    family: NumericFamily,
    value: CellValue,
) -> ConsoleResult<CellValue> {
    let number = match value {
        CellValue::Number(number) => number,
        CellValue::String(text) => text.trim().parse::<serde_json::Number>().map_err(|_| {
            ConsoleError::validation(format!("key column {column:?} takes a number, got {text:?}"))
        })?,
        other => {
            return Err(ConsoleError::validation(format!(
                "key column {column:?} takes a number, got {other}"
            )))
        }
    };
    if number.is_i64() || number.is_u64() {
        return Ok(CellValue::Number(number));
    }
    let float = number.as_f64().unwrap_or(f64::NAN);
    if float.fract() == 0.0 && float.abs() < EXACT_INTEGER_LIMIT {
        return Ok(CellValue::from(float as i64));
    }
    match family {
        NumericFamily::Integer => Err(ConsoleError::validation(format!(
            "key column {column:?} takes whole numbers, got {number}"
        ))),
        NumericFamily::Decimal => Ok(CellValue::Number(number)),
    }
}

fn validate_row_key(table: &TableAccess, row: &RowKey) -> ConsoleResult<()> {
    match row {
        RowKey::Staged(key) => {
            let valid = key
                .strip_prefix(STAGED_ROW_PREFIX)
                .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false);
            if valid {
                Ok(())
            } else {
                Err(ConsoleError::validation(format!(
                    "row key {key:?} is not a staged row"
                )))
            }
        }
        RowKey::Primary(columns) => {
            if !table.has_primary_key() {
                return Err(ConsoleError::validation(format!(
                    "table {:?} has no primary key, rows cannot be addressed",
                    table.name
                )));
            }
            let matches = columns.len() == table.primary_key.len()
                && table.primary_key.iter().all(|name| columns.contains_key(name));
            if !matches {
                return Err(ConsoleError::validation(format!(
                    "row key must name exactly the primary key columns {:?}",
                    table.primary_key
                )));
            }
            if columns.values().any(CellValue::is_null) {
                return Err(ConsoleError::validation("primary key values must not be null"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::fixtures::users_table;
    use crate::access::Privileges;
    use serde_json::json;

    #[test]
    fn op_requests_parse_by_kind() {
        let update: OpRequest = serde_json::from_value(json!({
            "kind": "update_cell",
            "row": {"id": 7},
            "column": "name",
            "old_value": "old",
            "new_value": "new"
        }))
        .expect("update");
        assert_eq!(update.operation(), Operation::Update);

        let staged: OpRequest = serde_json::from_value(json!({
            "kind": "delete_row",
            "row": "insert:2"
        }))
        .expect("delete");
        assert_eq!(
            staged,
            OpRequest::DeleteRow {
                row: RowKey::Staged("insert:2".to_string())
            }
        );

        let insert: OpRequest =
            serde_json::from_value(json!({"kind": "insert_row"})).expect("insert");
        assert_eq!(insert.operation(), Operation::Insert);
    }

    #[test]
    fn row_keys_must_match_primary_key() {
        let table = users_table(Privileges::all());
        let good = OpRequest::DeleteRow {
            row: RowKey::Primary(BTreeMap::from([("id".to_string(), json!(7))])),
        };
        assert!(validate_change(&table, &good).is_ok());

        let wrong = OpRequest::DeleteRow {
            row: RowKey::Primary(BTreeMap::from([("name".to_string(), json!("x"))])),
        };
        assert!(validate_change(&table, &wrong).is_err());

        let bogus = OpRequest::DeleteRow {
            row: RowKey::Staged("row-7".to_string()),
        };
        assert!(validate_change(&table, &bogus).is_err());

        let unknown_column = OpRequest::UpdateCell {
            row: RowKey::Primary(BTreeMap::from([("id".to_string(), json!(7))])),
            column: "nope".to_string(),
            old_value: CellValue::Null,
            new_value: json!(1),
        };
        assert!(validate_change(&table, &unknown_column).is_err());
    }

    #[test]
    fn equal_numeric_keys_share_one_identity() {
        let table = users_table(Privileges::all());
        let delete = |id: CellValue| {
            let request = OpRequest::DeleteRow {
                row: RowKey::Primary(BTreeMap::from([("id".to_string(), id)])),
            };
            match canonicalize(&table, request).expect("canonical") {
                OpRequest::DeleteRow { row } => row.identity(),
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(delete(json!(7)), delete(json!(7.0)));
        assert_eq!(delete(json!(7)), delete(json!("7")));
        assert_ne!(delete(json!(7)), delete(json!(8)));

        let fractional = OpRequest::DeleteRow {
            row: RowKey::Primary(BTreeMap::from([("id".to_string(), json!(7.5))])),
        };
        assert!(canonicalize(&table, fractional).is_err());
        let word = OpRequest::DeleteRow {
            row: RowKey::Primary(BTreeMap::from([("id".to_string(), json!("seven"))])),
        };
        assert!(canonicalize(&table, word).is_err());
    }

    #[test]
    fn numeric_families_follow_the_catalog_type() {
        assert_eq!(numeric_family("integer"), Some(NumericFamily::Integer));
        assert_eq!(numeric_family("BIGINT"), Some(NumericFamily::Integer));
        assert_eq!(numeric_family("numeric(10,2)"), Some(NumericFamily::Decimal));
        assert_eq!(numeric_family("text"), None);
        assert_eq!(
            canonical_number("price", NumericFamily::Decimal, json!(2.5)).expect("decimal"),
            json!(2.5)
        );
    }

    #[test]
    fn staged_op_serializes_flat() {
        let op = StagedOp {
            seq: 3,
            change: StagedChange::DeleteRow {
                row: RowKey::staged(1),
            },
            created_at: Instant::now(),
        };
        let value = serde_json::to_value(&op).expect("json");
        assert_eq!(value, json!({"seq": 3, "kind": "delete_row", "row": "insert:1"}));
    }
}
