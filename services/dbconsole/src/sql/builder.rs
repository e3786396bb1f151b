//! Canonical statement shapes.
//!
//! Every statement the console generates (as opposed to ad-hoc SQL the user
//! typed) comes from here. Identifiers are always double-quoted and values
//! always travel as positional parameters cast to the column's catalog type,
//! so the bound parameter type never has to match the column exactly.
use crate::access::{TableAccess, TableRef};
use crate::backend::CellValue;
use crate::error::{ConsoleError, ConsoleResult};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<CellValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`. The database is implied by the connection.
pub fn qualified(target: &TableRef) -> String {
    format!("{}.{}", quote_ident(&target.schema), quote_ident(&target.table))
}

/// Columns to order a page by: the requested column if the table has it,
/// otherwise the primary key, otherwise the first column.
pub fn order_columns(table: &TableAccess, sort: Option<&str>) -> ConsoleResult<Vec<String>> {
    match sort.map(str::trim).filter(|sort| !sort.is_empty()) {
        Some(column) => {
            if table.column(column).is_none() {
                return Err(ConsoleError::validation(format!(
                    "unknown sort column {column:?}"
                )));
            }
            Ok(vec![column.to_string()])
        }
        None if table.has_primary_key() => Ok(table.primary_key.clone()),
        None => Ok(table
            .columns
            .first()
            .map(|column| vec![column.name.clone()])
            .unwrap_or_default()),
    }
}

fn where_clause(filter: Option<&str>) -> String {
    filter
        .map(|filter| format!(" WHERE ({filter})"))
        .unwrap_or_default()
}

/// Filter text must already have passed [`crate::sql::validate_filter`].
pub fn select_page(
    target: &TableRef,
    filter: Option<&str>,
    order_by: &[String],
    order: SortOrder,
    limit: u64,
    offset: u64,
) -> String {
    let mut sql = format!("SELECT * FROM {}{}", qualified(target), where_clause(filter));
    if !order_by.is_empty() {
        let columns: Vec<String> = order_by
            .iter()
            .map(|column| format!("{} {}", quote_ident(column), order.keyword()))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&columns.join(", "));
    }
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
    sql
}

pub fn count_rows(target: &TableRef, filter: Option<&str>) -> String {
    format!(
        "SELECT COUNT(*) FROM {}{}",
        qualified(target),
        where_clause(filter)
    )
}

fn cast_param(index: usize, data_type: &str) -> String {
    format!("CAST(${index} AS {data_type})")
}

fn column_type<'a>(table: &'a TableAccess, column: &str) -> ConsoleResult<&'a str> {
    table
        .column(column)
        .map(|info| info.data_type.as_str())
        .ok_or_else(|| ConsoleError::validation(format!("unknown column {column:?}")))
}

/// `"pk1" = CAST($n AS t) AND ...` starting at parameter `first_index`.
fn key_predicate(
    table: &TableAccess,
    key: &[(String, CellValue)],
    first_index: usize,
    params: &mut Vec<CellValue>,
) -> ConsoleResult<String> {
    let mut terms = Vec::with_capacity(key.len());
    for (offset, (column, value)) in key.iter().enumerate() {
        let data_type = column_type(table, column)?;
        terms.push(format!(
            "{} = {}",
            quote_ident(column),
            cast_param(first_index + offset, data_type)
        ));
        params.push(value.clone());
    }
    Ok(terms.join(" AND "))
}

pub fn insert_row(
    target: &TableRef,
    table: &TableAccess,
    values: &[(String, CellValue)],
) -> ConsoleResult<Statement> {
    if values.is_empty() {
        return Ok(Statement {
            sql: format!("INSERT INTO {} DEFAULT VALUES", qualified(target)),
            params: Vec::new(),
        });
    }
    let mut columns = Vec::with_capacity(values.len());
    let mut casts = Vec::with_capacity(values.len());
    let mut params = Vec::with_capacity(values.len());
    for (index, (column, value)) in values.iter().enumerate() {
        columns.push(quote_ident(column));
        casts.push(cast_param(index + 1, column_type(table, column)?));
        params.push(value.clone());
    }
    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified(target),
            columns.join(", "),
            casts.join(", ")
        ),
        params,
    })
}

pub fn update_cells(
    target: &TableRef,
    table: &TableAccess,
    assignments: &[(String, CellValue)],
    key: &[(String, CellValue)],
) -> ConsoleResult<Statement> {
    if key.is_empty() {
        return Err(ConsoleError::validation(
            "updates need a primary key to address the row",
        ));
    }
    let mut params = Vec::with_capacity(assignments.len() + key.len());
    let mut sets = Vec::with_capacity(assignments.len());
    for (index, (column, value)) in assignments.iter().enumerate() {
        sets.push(format!(
            "{} = {}",
            quote_ident(column),
            cast_param(index + 1, column_type(table, column)?)
        ));
        params.push(value.clone());
    }
    let predicate = key_predicate(table, key, assignments.len() + 1, &mut params)?;
    Ok(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            qualified(target),
            sets.join(", "),
            predicate
        ),
        params,
    })
}

pub fn delete_row(
    target: &TableRef,
    table: &TableAccess,
    key: &[(String, CellValue)],
) -> ConsoleResult<Statement> {
    if key.is_empty() {
        return Err(ConsoleError::validation(
            "deletes need a primary key to address the row",
        ));
    }
    let mut params = Vec::with_capacity(key.len());
    let predicate = key_predicate(table, key, 1, &mut params)?;
    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {}", qualified(target), predicate),
        params,
    })
}
