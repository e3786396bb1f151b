//! Tokenizer and parser for the SQL dialect the in-memory engine accepts.
//!
//! Covered: `SELECT` (projection list, `*` or `COUNT(*)`, optional `FROM`,
//! `WHERE`, `ORDER BY`, `LIMIT`, `OFFSET`), `INSERT ... VALUES`, `UPDATE`,
//! `DELETE`, and `BEGIN`/`COMMIT`/`ROLLBACK`. Expressions support `AND`,
//! `OR`, `NOT`, comparisons, `IS [NOT] NULL`, `[NOT] LIKE`, `[NOT] IN (...)`,
//! `CAST(x AS type)`, `x::type`, literals and positional parameters.
use crate::backend::{BackendError, BackendResult, CellValue};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Str(String),
    Number(String),
    Param(usize),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "<>", "!=", "<=", ">=", "::", "(", ")", ",", ".", "*", "=", "<", ">", ";", "+", "-",
];

const RESERVED: &[&str] = &[
    "AND", "AS", "ASC", "BY", "DESC", "FROM", "IN", "IS", "LIKE", "LIMIT", "NOT", "OFFSET", "OR",
    "ORDER", "RETURNING", "SET", "VALUES", "WHERE",
];

fn unsupported(message: impl Into<String>) -> BackendError {
    BackendError::Query(message.into())
}

fn tokenize(sql: &str) -> BackendResult<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
            continue;
        }
        if ch == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if ch == '/' && chars.get(i + 1) == Some(&'*') {
            let mut depth = 0usize;
            loop {
                if i + 1 >= chars.len() {
                    return Err(unsupported("unterminated comment"));
                }
                if chars[i] == '/' && chars[i + 1] == '*' {
                    depth += 1;
                    i += 2;
                } else if chars[i] == '*' && chars[i + 1] == '/' {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            continue;
        }
        if ch == '\'' || ch == '"' {
            let (text, end) = quoted(&chars, i, ch)?;
            tokens.push(if ch == '\'' {
                Token::Str(text)
            } else {
                Token::Quoted(text)
            });
            i = end;
            continue;
        }
        if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
            continue;
        }
        if ch == '$' {
            let start = i + 1;
            i = start;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let index: String = chars[start..i].iter().collect();
            let index = index
                .parse::<usize>()
                .map_err(|_| unsupported("dollar quoting is not supported"))?;
            tokens.push(Token::Param(index));
            continue;
        }
        if ch.is_alphabetic() || ch == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        let op = OPERATORS
            .iter()
            .find(|op| rest.starts_with(**op))
            .ok_or_else(|| unsupported(format!("syntax error at or near \"{ch}\"")))?;
        tokens.push(Token::Op(*op));
        i += op.chars().count();
    }
    while tokens.last() == Some(&Token::Op(";")) {
        tokens.pop();
    }
    Ok(tokens)
}

fn quoted(chars: &[char], start: usize, quote: char) -> BackendResult<(String, usize)> {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                text.push(quote);
                i += 2;
                continue;
            }
            return Ok((text, i + 1));
        }
        text.push(chars[i]);
        i += 1;
    }
    Err(unsupported("unterminated quoted string"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    All,
    Count,
    Items(Vec<(Expr, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Select {
        projection: Projection,
        from: Option<TableName>,
        filter: Option<Expr>,
        order_by: Vec<(String, bool)>,
        limit: Option<u64>,
        offset: Option<u64>,
    },
    Insert {
        table: TableName,
        columns: Vec<String>,
        rows: Vec<Vec<Expr>>,
    },
    Update {
        table: TableName,
        sets: Vec<(String, Expr)>,
        filter: Option<Expr>,
    },
    Delete {
        table: TableName,
        filter: Option<Expr>,
    },
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(CellValue),
    Param(usize),
    Cast(Box<Expr>, String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    IsNull(Box<Expr>, bool),
    Like(Box<Expr>, Box<Expr>, bool),
    InList(Box<Expr>, Vec<Expr>, bool),
}

pub fn parse(sql: &str) -> BackendResult<Stmt> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
    };
    let stmt = parser.statement()?;
    if parser.pos < parser.tokens.len() {
        return Err(unsupported(format!(
            "syntax error at or near {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(stmt)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> BackendResult<()> {
        if self.keyword(keyword) {
            Ok(())
        } else {
            Err(unsupported(format!("expected {keyword}")))
        }
    }

    fn op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(found)) if *found == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> BackendResult<()> {
        if self.op(op) {
            Ok(())
        } else {
            Err(unsupported(format!("expected \"{op}\"")))
        }
    }

    fn identifier(&mut self) -> BackendResult<String> {
        match self.next() {
            Some(Token::Quoted(name)) => Ok(name),
            Some(Token::Word(word)) if !is_reserved(&word) => Ok(word.to_lowercase()),
            other => Err(unsupported(format!("expected identifier, got {other:?}"))),
        }
    }

    fn table_name(&mut self) -> BackendResult<TableName> {
        let mut parts = vec![self.identifier()?];
        while self.op(".") {
            parts.push(self.identifier()?);
        }
        let table = parts.pop().unwrap_or_default();
        let schema = parts.pop().unwrap_or_else(|| "public".to_string());
        Ok(TableName { schema, table })
    }

    fn number(&mut self) -> BackendResult<u64> {
        match self.next() {
            Some(Token::Number(text)) => text
                .parse()
                .map_err(|_| unsupported(format!("invalid count {text}"))),
            other => Err(unsupported(format!("expected number, got {other:?}"))),
        }
    }

    fn statement(&mut self) -> BackendResult<Stmt> {
        if self.keyword("BEGIN") || self.keyword("START") {
            self.keyword("TRANSACTION");
            return Ok(Stmt::Begin);
        }
        if self.keyword("COMMIT") || self.keyword("END") {
            return Ok(Stmt::Commit);
        }
        if self.keyword("ROLLBACK") || self.keyword("ABORT") {
            return Ok(Stmt::Rollback);
        }
        if self.keyword("SELECT") {
            return self.select();
        }
        if self.keyword("INSERT") {
            return self.insert();
        }
        if self.keyword("UPDATE") {
            return self.update();
        }
        if self.keyword("DELETE") {
            self.expect_keyword("FROM")?;
            let table = self.table_name()?;
            let filter = self.where_clause()?;
            return Ok(Stmt::Delete { table, filter });
        }
        Err(unsupported(
            "statement not supported by the in-memory backend",
        ))
    }

    fn select(&mut self) -> BackendResult<Stmt> {
        let projection = if self.op("*") {
            Projection::All
        } else if self.peek_keyword("COUNT")
            && self.tokens.get(self.pos + 1) == Some(&Token::Op("("))
            && self.tokens.get(self.pos + 2) == Some(&Token::Op("*"))
        {
            self.pos += 3;
            self.expect_op(")")?;
            Projection::Count
        } else {
            let mut items = Vec::new();
            loop {
                let expr = self.expr()?;
                let label = if self.keyword("AS") {
                    self.identifier()?
                } else if matches!(self.peek(), Some(Token::Word(word)) if !is_reserved(word)) {
                    self.identifier()?
                } else {
                    match &expr {
                        Expr::Column(name) => name.clone(),
                        _ => "?column?".to_string(),
                    }
                };
                items.push((expr, label));
                if !self.op(",") {
                    break;
                }
            }
            Projection::Items(items)
        };
        let from = if self.keyword("FROM") {
            Some(self.table_name()?)
        } else {
            None
        };
        let filter = self.where_clause()?;
        let mut order_by = Vec::new();
        if self.keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let column = self.identifier()?;
                let descending = if self.keyword("DESC") {
                    true
                } else {
                    self.keyword("ASC");
                    false
                };
                order_by.push((column, descending));
                if !self.op(",") {
                    break;
                }
            }
        }
        let mut limit = None;
        let mut offset = None;
        loop {
            if self.keyword("LIMIT") {
                limit = Some(self.number()?);
            } else if self.keyword("OFFSET") {
                offset = Some(self.number()?);
            } else {
                break;
            }
        }
        Ok(Stmt::Select {
            projection,
            from,
            filter,
            order_by,
            limit,
            offset,
        })
    }

    fn insert(&mut self) -> BackendResult<Stmt> {
        self.expect_keyword("INTO")?;
        let table = self.table_name()?;
        let mut columns = Vec::new();
        if self.keyword("DEFAULT") {
            self.expect_keyword("VALUES")?;
            return Ok(Stmt::Insert {
                table,
                columns,
                rows: vec![Vec::new()],
            });
        }
        self.expect_op("(")?;
        loop {
            columns.push(self.identifier()?);
            if !self.op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        self.expect_keyword("VALUES")?;
        let mut rows = Vec::new();
        loop {
            self.expect_op("(")?;
            let mut values = Vec::new();
            loop {
                values.push(self.expr()?);
                if !self.op(",") {
                    break;
                }
            }
            self.expect_op(")")?;
            if values.len() != columns.len() {
                return Err(unsupported(
                    "INSERT has a different number of values than columns",
                ));
            }
            rows.push(values);
            if !self.op(",") {
                break;
            }
        }
        Ok(Stmt::Insert {
            table,
            columns,
            rows,
        })
    }

    fn update(&mut self) -> BackendResult<Stmt> {
        let table = self.table_name()?;
        self.expect_keyword("SET")?;
        let mut sets = Vec::new();
        loop {
            let column = self.identifier()?;
            self.expect_op("=")?;
            sets.push((column, self.expr()?));
            if !self.op(",") {
                break;
            }
        }
        let filter = self.where_clause()?;
        Ok(Stmt::Update {
            table,
            sets,
            filter,
        })
    }

    fn where_clause(&mut self) -> BackendResult<Option<Expr>> {
        if self.keyword("WHERE") {
            Ok(Some(self.expr()?))
        } else {
            Ok(None)
        }
    }

    fn expr(&mut self) -> BackendResult<Expr> {
        let mut left = self.and_expr()?;
        while self.keyword("OR") {
            left = Expr::Or(Box::new(left), Box::new(self.and_expr()?));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> BackendResult<Expr> {
        let mut left = self.not_expr()?;
        while self.keyword("AND") {
            left = Expr::And(Box::new(left), Box::new(self.not_expr()?));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> BackendResult<Expr> {
        if self.keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.predicate()
    }

    fn predicate(&mut self) -> BackendResult<Expr> {
        let left = self.unary()?;
        if self.keyword("IS") {
            let negated = self.keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Expr::IsNull(Box::new(left), negated));
        }
        let negated = self.keyword("NOT");
        if self.keyword("LIKE") {
            return Ok(Expr::Like(Box::new(left), Box::new(self.unary()?), negated));
        }
        if self.keyword("IN") {
            self.expect_op("(")?;
            let mut items = Vec::new();
            loop {
                items.push(self.expr()?);
                if !self.op(",") {
                    break;
                }
            }
            self.expect_op(")")?;
            return Ok(Expr::InList(Box::new(left), items, negated));
        }
        if negated {
            return Err(unsupported("expected LIKE or IN after NOT"));
        }
        let op = match self.peek() {
            Some(Token::Op("=")) => CmpOp::Eq,
            Some(Token::Op("<>")) | Some(Token::Op("!=")) => CmpOp::Ne,
            Some(Token::Op("<")) => CmpOp::Lt,
            Some(Token::Op("<=")) => CmpOp::Le,
            Some(Token::Op(">")) => CmpOp::Gt,
            Some(Token::Op(">=")) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        Ok(Expr::Compare(Box::new(left), op, Box::new(self.unary()?)))
    }

    fn unary(&mut self) -> BackendResult<Expr> {
        if self.op("-") {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        let mut expr = self.primary()?;
        while self.op("::") {
            expr = Expr::Cast(Box::new(expr), self.type_name(false)?);
        }
        Ok(expr)
    }

    fn primary(&mut self) -> BackendResult<Expr> {
        match self.next() {
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::Number(text)) => Ok(Expr::Literal(number_value(&text)?)),
            Some(Token::Param(index)) => Ok(Expr::Param(index)),
            Some(Token::Op("(")) => {
                let inner = self.expr()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("NULL") => {
                Ok(Expr::Literal(Value::Null))
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("TRUE") => {
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Some(Token::Word(word)) if word.eq_ignore_ascii_case("FALSE") => {
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Some(Token::Word(word))
                if word.eq_ignore_ascii_case("CAST") && self.peek() == Some(&Token::Op("(")) =>
            {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect_keyword("AS")?;
                let data_type = self.type_name(true)?;
                self.expect_op(")")?;
                Ok(Expr::Cast(Box::new(inner), data_type))
            }
            Some(Token::Word(word)) if !is_reserved(&word) => {
                let mut name = word.to_lowercase();
                while self.op(".") {
                    name = self.identifier()?;
                }
                Ok(Expr::Column(name))
            }
            Some(Token::Quoted(name)) => {
                let mut name = name;
                while self.op(".") {
                    name = self.identifier()?;
                }
                Ok(Expr::Column(name))
            }
            other => Err(unsupported(format!(
                "syntax error at or near {other:?}"
            ))),
        }
    }

    /// Type name as written, lowercased; `in_cast` consumes multi-word names
    /// up to the closing parenthesis of `CAST(...)`.
    fn type_name(&mut self, in_cast: bool) -> BackendResult<String> {
        let mut parts: Vec<String> = Vec::new();
        loop {
            match self.peek().cloned() {
                Some(Token::Word(word)) if in_cast || parts.is_empty() => {
                    self.pos += 1;
                    parts.push(word.to_lowercase());
                }
                Some(Token::Op("(")) if !parts.is_empty() => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    while let Some(Token::Number(number)) = self.peek().cloned() {
                        self.pos += 1;
                        args.push(number);
                        if !self.op(",") {
                            break;
                        }
                    }
                    self.expect_op(")")?;
                    if let Some(last) = parts.last_mut() {
                        last.push_str(&format!("({})", args.join(",")));
                    }
                }
                _ => break,
            }
        }
        if parts.is_empty() {
            return Err(unsupported("expected type name"));
        }
        Ok(parts.join(" "))
    }
}

fn is_reserved(word: &str) -> bool {
    RESERVED
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(word))
}

fn number_value(text: &str) -> BackendResult<Value> {
    if let Ok(integer) = text.parse::<i64>() {
        return Ok(Value::from(integer));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| unsupported(format!("invalid number {text}")))
}
