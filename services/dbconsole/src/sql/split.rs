//! Splitting editor text into individual statements.
use crate::sql::lexer::{scan, LexError, SegmentKind};

/// Split `sql` on top-level `;`. Semicolons inside literals, quoted
/// identifiers, comments and dollar-quoted bodies do not split. Statements
/// that are empty or only comments are dropped; the rest keep their original
/// text, trimmed.
pub fn split_statements(sql: &str) -> Result<Vec<String>, LexError> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut has_content = false;

    for segment in scan(sql)? {
        match segment.kind {
            SegmentKind::Code => {
                let mut parts = segment.text.split(';');
                if let Some(first) = parts.next() {
                    push_code(&mut current, &mut has_content, first);
                }
                for part in parts {
                    finish(&mut statements, &mut current, &mut has_content);
                    push_code(&mut current, &mut has_content, part);
                }
            }
            SegmentKind::Comment => current.push_str(segment.text),
            _ => {
                current.push_str(segment.text);
                has_content = true;
            }
        }
    }
    finish(&mut statements, &mut current, &mut has_content);
    Ok(statements)
}

fn push_code(current: &mut String, has_content: &mut bool, text: &str) {
    if !text.trim().is_empty() {
        *has_content = true;
    }
    current.push_str(text);
}

fn finish(statements: &mut Vec<String>, current: &mut String, has_content: &mut bool) {
    if *has_content {
        statements.push(current.trim().to_string());
    }
    current.clear();
    *has_content = false;
}

/// First keyword of a statement, uppercased, skipping leading comments and
/// parentheses.
pub fn leading_keyword(statement: &str) -> Option<String> {
    let segments = scan(statement).ok()?;
    for segment in segments {
        match segment.kind {
            SegmentKind::Comment => continue,
            SegmentKind::Code => {
                let trimmed = segment.text.trim_start_matches(|ch: char| ch.is_whitespace() || ch == '(');
                if trimmed.is_empty() {
                    continue;
                }
                let word: String = trimmed
                    .chars()
                    .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
                    .collect();
                return (!word.is_empty()).then(|| word.to_ascii_uppercase());
            }
            _ => return None,
        }
    }
    None
}

/// Whether the statement produces a row set worth paging.
pub fn returns_rows(statement: &str) -> bool {
    let returning = scan(statement).is_ok_and(|segments| {
        segments
            .iter()
            .filter(|segment| segment.kind == SegmentKind::Code)
            .any(|segment| {
                segment
                    .text
                    .split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .any(|word| word.eq_ignore_ascii_case("RETURNING"))
            })
    });
    returning
        || matches!(
            leading_keyword(statement).as_deref(),
            Some("SELECT" | "WITH" | "VALUES" | "SHOW" | "TABLE" | "EXPLAIN")
        )
}

/// Whether the statement would change the connection's transaction state or
/// identity. Such statements cannot run on a pooled connection.
pub fn alters_session(statement: &str) -> bool {
    let Ok(segments) = scan(statement) else {
        return false;
    };
    let words: Vec<String> = segments
        .iter()
        .filter(|segment| segment.kind == SegmentKind::Code)
        .flat_map(|segment| {
            segment
                .text
                .split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                .filter(|word| !word.is_empty())
                .map(str::to_ascii_uppercase)
        })
        .take(3)
        .collect();
    match words.first().map(String::as_str) {
        Some(
            "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "ABORT" | "SAVEPOINT" | "RELEASE"
            | "PREPARE",
        ) => true,
        Some("SET" | "RESET") => words[1..]
            .iter()
            .any(|word| word == "ROLE" || word == "AUTHORIZATION" || word == "SESSION"),
        _ => false,
    }
}
