//! Statement execution over in-memory tables.
use super::parse::{CmpOp, Expr, Projection, Stmt, TableName};
use crate::access::{Operation, Privileges};
use crate::backend::{BackendError, BackendResult, CellValue, Rows};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
    /// Per-role privileges.
    #[serde(default)]
    pub grants: BTreeMap<String, Privileges>,
    #[serde(default)]
    pub rows: Vec<Vec<CellValue>>,
}

impl TableDef {
    fn column_index(&self, name: &str) -> BackendResult<usize> {
        self.columns
            .iter()
            .position(|column| column.name == name)
            .ok_or_else(|| BackendError::Query(format!("column \"{name}\" does not exist")))
    }

    fn key_of(&self, row: &[CellValue]) -> Option<Vec<CellValue>> {
        if self.primary_key.is_empty() {
            return None;
        }
        self.primary_key
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .position(|column| &column.name == name)
                    .and_then(|index| row.get(index).cloned())
            })
            .collect()
    }

    pub fn privileges_for(&self, role: &str) -> Privileges {
        self.grants.get(role).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseDef {
    /// schema name -> table name -> table
    #[serde(default)]
    pub schemas: BTreeMap<String, BTreeMap<String, TableDef>>,
}

impl DatabaseDef {
    fn table_mut(&mut self, name: &TableName) -> BackendResult<&mut TableDef> {
        self.schemas
            .get_mut(&name.schema)
            .and_then(|tables| tables.get_mut(&name.table))
            .ok_or_else(|| {
                BackendError::Query(format!(
                    "relation \"{}.{}\" does not exist",
                    name.schema, name.table
                ))
            })
    }
}

/// Control statements are reported back so the connection can manage its
/// working copy.
#[derive(Debug)]
pub enum Outcome {
    Rows(Rows),
    Begin,
    Commit,
    Rollback,
}

pub fn run(
    db: &mut DatabaseDef,
    role: &str,
    stmt: Stmt,
    params: &[CellValue],
) -> BackendResult<Outcome> {
    match stmt {
        Stmt::Begin => Ok(Outcome::Begin),
        Stmt::Commit => Ok(Outcome::Commit),
        Stmt::Rollback => Ok(Outcome::Rollback),
        Stmt::Select {
            projection,
            from,
            filter,
            order_by,
            limit,
            offset,
        } => {
            let Some(from) = from else {
                return select_without_table(projection, params).map(Outcome::Rows);
            };
            let table: &TableDef = db.table_mut(&from)?;
            require(table, role, Operation::Select, &from)?;
            let mut matched = Vec::new();
            for row in &table.rows {
                if matches_filter(filter.as_ref(), table, row, params)? {
                    matched.push(row.clone());
                }
            }
            if projection == Projection::Count {
                return Ok(Outcome::Rows(Rows {
                    columns: vec!["count".to_string()],
                    rows: vec![vec![Value::from(matched.len() as u64)]],
                    total: 1,
                    rows_affected: 0,
                }));
            }
            let mut keys = Vec::with_capacity(order_by.len());
            for (column, descending) in &order_by {
                keys.push((table.column_index(column)?, *descending));
            }
            if !keys.is_empty() {
                matched.sort_by(|a, b| {
                    for (index, descending) in &keys {
                        let ordering = order_values(&a[*index], &b[*index]);
                        let ordering = if *descending {
                            ordering.reverse()
                        } else {
                            ordering
                        };
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                    Ordering::Equal
                });
            }
            let page: Vec<Vec<CellValue>> = matched
                .into_iter()
                .skip(offset.unwrap_or(0) as usize)
                .take(limit.map(|limit| limit as usize).unwrap_or(usize::MAX))
                .collect();
            let (columns, rows) = match projection {
                Projection::Items(items) => {
                    let mut rows = Vec::with_capacity(page.len());
                    for row in &page {
                        let ctx = Ctx {
                            table: Some(table),
                            row: Some(row.as_slice()),
                            params,
                        };
                        rows.push(
                            items
                                .iter()
                                .map(|(expr, _)| eval(expr, &ctx))
                                .collect::<BackendResult<Vec<_>>>()?,
                        );
                    }
                    (items.into_iter().map(|(_, label)| label).collect(), rows)
                }
                _ => (
                    table.columns.iter().map(|column| column.name.clone()).collect(),
                    page,
                ),
            };
            let total = rows.len() as u64;
            Ok(Outcome::Rows(Rows {
                columns,
                rows,
                total,
                rows_affected: 0,
            }))
        }
        Stmt::Insert {
            table: name,
            columns,
            rows,
        } => {
            let table = db.table_mut(&name)?;
            require(table, role, Operation::Insert, &name)?;
            let mut indexes = Vec::with_capacity(columns.len());
            for column in &columns {
                indexes.push(table.column_index(column)?);
            }
            let mut staged = Vec::with_capacity(rows.len());
            for values in rows {
                let mut row = vec![Value::Null; table.columns.len()];
                let ctx = Ctx {
                    table: None,
                    row: None,
                    params,
                };
                for (index, expr) in indexes.iter().zip(values.iter()) {
                    let value = eval(expr, &ctx)?;
                    row[*index] = cast(value, &table.columns[*index].data_type)?;
                }
                check_not_null(table, &row)?;
                staged.push(row);
            }
            let mut candidate = table.rows.clone();
            candidate.extend(staged.iter().cloned());
            check_unique(table, &candidate)?;
            let affected = staged.len() as u64;
            table.rows = candidate;
            Ok(Outcome::Rows(affected_rows(affected)))
        }
        Stmt::Update {
            table: name,
            sets,
            filter,
        } => {
            let table = db.table_mut(&name)?;
            require(table, role, Operation::Update, &name)?;
            let mut targets = Vec::with_capacity(sets.len());
            for (column, expr) in &sets {
                targets.push((table.column_index(column)?, expr));
            }
            let mut updated = table.rows.clone();
            let mut affected = 0u64;
            for row in updated.iter_mut() {
                if !matches_filter(filter.as_ref(), table, row, params)? {
                    continue;
                }
                let original = row.clone();
                let ctx = Ctx {
                    table: Some(&*table),
                    row: Some(original.as_slice()),
                    params,
                };
                for (index, expr) in &targets {
                    let value = eval(expr, &ctx)?;
                    row[*index] = cast(value, &table.columns[*index].data_type)?;
                }
                check_not_null(table, row)?;
                affected += 1;
            }
            check_unique(table, &updated)?;
            table.rows = updated;
            Ok(Outcome::Rows(affected_rows(affected)))
        }
        Stmt::Delete {
            table: name,
            filter,
        } => {
            let table = db.table_mut(&name)?;
            require(table, role, Operation::Delete, &name)?;
            let mut kept = Vec::with_capacity(table.rows.len());
            let mut affected = 0u64;
            for row in &table.rows {
                if matches_filter(filter.as_ref(), table, row, params)? {
                    affected += 1;
                } else {
                    kept.push(row.clone());
                }
            }
            table.rows = kept;
            Ok(Outcome::Rows(affected_rows(affected)))
        }
    }
}

fn affected_rows(affected: u64) -> Rows {
    Rows {
        columns: Vec::new(),
        rows: Vec::new(),
        total: 0,
        rows_affected: affected,
    }
}

fn require(table: &TableDef, role: &str, op: Operation, name: &TableName) -> BackendResult<()> {
    if table.privileges_for(role).allows(op) {
        Ok(())
    } else {
        Err(BackendError::Denied(format!(
            "permission denied for table {}",
            name.table
        )))
    }
}

fn select_without_table(projection: Projection, params: &[CellValue]) -> BackendResult<Rows> {
    let Projection::Items(items) = projection else {
        return Err(BackendError::Query(
            "SELECT * with no tables specified is not valid".to_string(),
        ));
    };
    let ctx = Ctx {
        table: None,
        row: None,
        params,
    };
    let row = items
        .iter()
        .map(|(expr, _)| eval(expr, &ctx))
        .collect::<BackendResult<Vec<_>>>()?;
    Ok(Rows {
        columns: items.into_iter().map(|(_, label)| label).collect(),
        rows: vec![row],
        total: 1,
        rows_affected: 0,
    })
}

fn check_not_null(table: &TableDef, row: &[CellValue]) -> BackendResult<()> {
    for (column, value) in table.columns.iter().zip(row) {
        let required = !column.nullable || table.primary_key.contains(&column.name);
        if required && value.is_null() {
            return Err(BackendError::Query(format!(
                "null value in column \"{}\" violates not-null constraint",
                column.name
            )));
        }
    }
    Ok(())
}

fn check_unique(table: &TableDef, rows: &[Vec<CellValue>]) -> BackendResult<()> {
    let mut seen = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(key) = table.key_of(row) else {
            return Ok(());
        };
        if seen.contains(&key) {
            return Err(BackendError::Query(
                "duplicate key value violates unique constraint".to_string(),
            ));
        }
        seen.push(key);
    }
    Ok(())
}

fn matches_filter(
    filter: Option<&Expr>,
    table: &TableDef,
    row: &[CellValue],
    params: &[CellValue],
) -> BackendResult<bool> {
    let Some(filter) = filter else {
        return Ok(true);
    };
    let ctx = Ctx {
        table: Some(table),
        row: Some(row),
        params,
    };
    Ok(eval(filter, &ctx)? == Value::Bool(true))
}

struct Ctx<'a> {
    table: Option<&'a TableDef>,
    row: Option<&'a [CellValue]>,
    params: &'a [CellValue],
}

fn eval(expr: &Expr, ctx: &Ctx<'_>) -> BackendResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Param(index) => index
            .checked_sub(1)
            .and_then(|index| ctx.params.get(index))
            .cloned()
            .ok_or_else(|| BackendError::Query(format!("there is no parameter ${index}"))),
        Expr::Column(name) => {
            let (Some(table), Some(row)) = (ctx.table, ctx.row) else {
                return Err(BackendError::Query(format!(
                    "column \"{name}\" does not exist"
                )));
            };
            Ok(row[table.column_index(name)?].clone())
        }
        Expr::Cast(inner, data_type) => cast(eval(inner, ctx)?, data_type),
        Expr::Neg(inner) => match eval(inner, ctx)? {
            Value::Null => Ok(Value::Null),
            value => match (value.as_i64(), value.as_f64()) {
                (Some(integer), _) => Ok(Value::from(-integer)),
                (None, Some(float)) => Ok(float_value(-float)),
                _ => Err(BackendError::Query(
                    "operator does not exist: - text".to_string(),
                )),
            },
        },
        Expr::Not(inner) => Ok(match truth(&eval(inner, ctx)?) {
            Some(value) => Value::Bool(!value),
            None => Value::Null,
        }),
        Expr::And(left, right) => {
            let left = truth(&eval(left, ctx)?);
            if left == Some(false) {
                return Ok(Value::Bool(false));
            }
            let right = truth(&eval(right, ctx)?);
            Ok(match (left, right) {
                (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            })
        }
        Expr::Or(left, right) => {
            let left = truth(&eval(left, ctx)?);
            if left == Some(true) {
                return Ok(Value::Bool(true));
            }
            let right = truth(&eval(right, ctx)?);
            Ok(match (left, right) {
                (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            })
        }
        Expr::Compare(left, op, right) => {
            let left = eval(left, ctx)?;
            let right = eval(right, ctx)?;
            Ok(match compare(&left, &right) {
                None => Value::Null,
                Some(ordering) => Value::Bool(match op {
                    CmpOp::Eq => ordering == Ordering::Equal,
                    CmpOp::Ne => ordering != Ordering::Equal,
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::Ge => ordering != Ordering::Less,
                }),
            })
        }
        Expr::IsNull(inner, negated) => Ok(Value::Bool(eval(inner, ctx)?.is_null() != *negated)),
        Expr::Like(value, pattern, negated) => {
            let value = eval(value, ctx)?;
            let pattern = eval(pattern, ctx)?;
            match (text_of(&value), text_of(&pattern)) {
                (Some(value), Some(pattern)) => {
                    let chars: Vec<char> = value.chars().collect();
                    let pattern: Vec<char> = pattern.chars().collect();
                    Ok(Value::Bool(like(&chars, &pattern) != *negated))
                }
                _ => Ok(Value::Null),
            }
        }
        Expr::InList(value, items, negated) => {
            let value = eval(value, ctx)?;
            if value.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in items {
                match compare(&value, &eval(item, ctx)?) {
                    Some(Ordering::Equal) => return Ok(Value::Bool(!*negated)),
                    None => saw_null = true,
                    Some(_) => {}
                }
            }
            Ok(if saw_null {
                Value::Null
            } else {
                Value::Bool(*negated)
            })
        }
    }
}

fn truth(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        _ => None,
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn like(value: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('%', rest)) => (0..=value.len()).any(|skip| like(&value[skip..], rest)),
        Some(('_', rest)) => !value.is_empty() && like(&value[1..], rest),
        Some((ch, rest)) => value.first() == Some(ch) && like(&value[1..], rest),
    }
}

/// SQL comparison: `None` when either side is NULL.
fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::String(b)) => a.as_f64()?.partial_cmp(&b.trim().parse().ok()?),
        (Value::String(a), Value::Number(b)) => a.trim().parse::<f64>().ok()?.partial_cmp(&b.as_f64()?),
        (a, b) => Some(a.to_string().cmp(&b.to_string())),
    }
}

/// Ordering for ORDER BY: NULLs sort last.
fn order_values(left: &Value, right: &Value) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare(left, right).unwrap_or(Ordering::Equal),
    }
}

fn float_value(float: f64) -> Value {
    serde_json::Number::from_f64(float)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn invalid_input(data_type: &str, value: &Value) -> BackendError {
    BackendError::Query(format!(
        "invalid input syntax for type {data_type}: {value}"
    ))
}

/// Coerce a value to the family of a catalog type name.
pub fn cast(value: Value, data_type: &str) -> BackendResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let base = data_type
        .split('(')
        .next()
        .unwrap_or(data_type)
        .trim()
        .to_ascii_lowercase();
    match base.as_str() {
        "smallint" | "integer" | "int" | "int2" | "int4" | "int8" | "bigint" | "serial"
        | "bigserial" => {
            let integer = match &value {
                Value::Number(number) => number.as_i64().or_else(|| {
                    number
                        .as_f64()
                        .filter(|float| float.fract() == 0.0)
                        .map(|float| float as i64)
                }),
                Value::String(text) => text.trim().parse::<i64>().ok(),
                _ => None,
            };
            integer
                .map(Value::from)
                .ok_or_else(|| invalid_input(&base, &value))
        }
        "numeric" | "decimal" | "real" | "double precision" | "float4" | "float8" => {
            match &value {
                Value::Number(_) => Ok(value),
                Value::String(text) => {
                    if let Ok(integer) = text.trim().parse::<i64>() {
                        return Ok(Value::from(integer));
                    }
                    text.trim()
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(|| invalid_input(&base, &value))
                }
                _ => Err(invalid_input(&base, &value)),
            }
        }
        "boolean" | "bool" => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "yes" | "y" | "on" | "1" => Ok(Value::Bool(true)),
                "f" | "false" | "no" | "n" | "off" | "0" => Ok(Value::Bool(false)),
                _ => Err(invalid_input(&base, &value)),
            },
            _ => Err(invalid_input(&base, &value)),
        },
        "json" | "jsonb" => match value {
            Value::String(text) => serde_json::from_str(&text)
                .map_err(|_| invalid_input(&base, &Value::String(text.clone()))),
            other => Ok(other),
        },
        _ => Ok(match value {
            Value::String(text) => Value::String(text),
            Value::Bool(flag) => Value::String(flag.to_string()),
            other => Value::String(other.to_string()),
        }),
    }
}
