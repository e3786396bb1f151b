//! WHERE-fragment validation.
//!
//! A user-typed filter is pasted into the generated SELECT as literal text,
//! so it has to be a single boolean expression and nothing else. The check is
//! syntactic: it rejects statement terminators, comment introducers,
//! positional parameters, unbalanced quotes or parentheses, `E'...'` escape
//! strings, and keywords that start or chain another statement. Standard
//! quoted literals are left alone.
use crate::error::{ConsoleError, ConsoleResult};
use crate::sql::lexer::{scan, SegmentKind};

pub const MAX_FILTER_LEN: usize = 4096;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "ALTER", "ANALYZE", "CALL", "COMMIT", "COPY", "CREATE", "DELETE", "DO", "DROP", "EXECUTE",
    "GRANT", "INSERT", "INTO", "LOCK", "MERGE", "PREPARE", "REINDEX", "RESET", "REVOKE",
    "ROLLBACK", "SET", "TRUNCATE", "UNION", "UPDATE", "VACUUM",
];

/// Validate a filter fragment. Returns the trimmed fragment, or `None` when
/// the user typed nothing.
pub fn validate_filter(fragment: &str) -> ConsoleResult<Option<String>> {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_FILTER_LEN {
        return Err(ConsoleError::validation("filter is too long"));
    }
    let segments =
        scan(trimmed).map_err(|err| ConsoleError::validation(format!("filter rejected: {err}")))?;

    let mut depth: i64 = 0;
    for segment in &segments {
        match segment.kind {
            SegmentKind::Comment => {
                return Err(ConsoleError::validation("filter may not contain comments"));
            }
            SegmentKind::DollarQuoted => {
                return Err(ConsoleError::validation(
                    "filter may not contain dollar-quoted strings",
                ));
            }
            SegmentKind::EscapeLiteral => {
                return Err(ConsoleError::validation(
                    "filter may not contain E'' escape strings",
                ));
            }
            SegmentKind::Literal | SegmentKind::QuotedIdent => {}
            SegmentKind::Code => {
                for ch in segment.text.chars() {
                    match ch {
                        ';' => {
                            return Err(ConsoleError::validation(
                                "filter may not contain ';'",
                            ));
                        }
                        '$' => {
                            return Err(ConsoleError::validation(
                                "filter may not contain parameters",
                            ));
                        }
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth < 0 {
                                return Err(ConsoleError::validation(
                                    "filter has unbalanced parentheses",
                                ));
                            }
                        }
                        _ => {}
                    }
                }
                if let Some(word) = words(segment.text).find(|word| is_forbidden(word)) {
                    return Err(ConsoleError::validation(format!(
                        "filter may not contain {}",
                        word.to_ascii_uppercase()
                    )));
                }
            }
        }
    }
    if depth != 0 {
        return Err(ConsoleError::validation("filter has unbalanced parentheses"));
    }
    Ok(Some(trimmed.to_string()))
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .filter(|word| !word.is_empty())
}

fn is_forbidden(word: &str) -> bool {
    FORBIDDEN_KEYWORDS
        .iter()
        .any(|keyword| keyword.eq_ignore_ascii_case(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn rejected(fragment: &str) -> bool {
        matches!(
            validate_filter(fragment),
            Err(err) if err.kind == ErrorKind::Validation
        )
    }

    #[test]
    fn accepts_escaped_quote_literal() {
        assert_eq!(
            validate_filter("name = 'O''Brien'").expect("valid"),
            Some("name = 'O''Brien'".to_string())
        );
    }

    #[test]
    fn rejects_statement_chaining() {
        assert!(rejected("1; DROP TABLE x"));
        assert!(rejected("id = 1 -- trailing"));
        assert!(rejected("id = 1 /* x */"));
        assert!(rejected("id = 1 UNION SELECT secret FROM keys"));
        assert!(rejected("id IN (1, 2"));
        assert!(rejected("id = 1)"));
        assert!(rejected("name = 'unterminated"));
        assert!(rejected("id = $1"));
    }

    #[test]
    fn rejects_escape_strings() {
        assert!(rejected(r"name = E'a\'' OR true)--'"));
        assert!(rejected(r"name = e'plain'"));
        assert!(rejected(r"(name = E'\'')"));
        assert!(rejected(r"name = E'a\'"));
        assert_eq!(
            validate_filter(r"name = 'C:\dir'").expect("standard literal"),
            Some(r"name = 'C:\dir'".to_string())
        );
        assert!(validate_filter("type = 'E'").is_ok());
    }

    #[test]
    fn keywords_inside_literals_and_identifiers_are_fine() {
        assert!(validate_filter("note = 'drop table; -- not code'").is_ok());
        assert!(validate_filter("\"update\" IS NOT NULL").is_ok());
        assert!(validate_filter("updated_at > '2024-01-01'").is_ok());
    }

    #[test]
    fn subqueries_are_allowed() {
        assert!(validate_filter("id IN (SELECT user_id FROM orders)").is_ok());
    }

    #[test]
    fn blank_filter_is_none() {
        assert_eq!(validate_filter("   ").expect("blank"), None);
    }
}
