//! Quote- and comment-aware scanner over raw SQL text.
//!
//! The scanner does not tokenize SQL; it only partitions text into regions
//! where `;`, parentheses and keywords mean something (code) and regions
//! where they do not (literals, quoted identifiers, comments, dollar-quoted
//! bodies). Escaped quotes (`''`, `""`) stay inside their region verbatim.
//! `E'...'` escape strings are their own region kind because a backslash
//! escapes the quote there, so `E'a\''` ends one quote later than a standard
//! literal would.
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    /// `'...'`, including the quotes.
    Literal,
    /// `E'...'`, including the prefix and the quotes.
    EscapeLiteral,
    /// `"..."`, including the quotes.
    QuotedIdent,
    /// `-- ...` or `/* ... */`.
    Comment,
    /// `$tag$ ... $tag$`.
    DollarQuoted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub kind: SegmentKind,
    pub text: &'a str,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedLiteral,
    #[error("unterminated quoted identifier")]
    UnterminatedIdentifier,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("unterminated dollar-quoted string")]
    UnterminatedDollarQuote,
}

pub fn scan(sql: &str) -> Result<Vec<Segment<'_>>, LexError> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let mut begin = i;
        let special = match bytes[i] {
            b'\'' if escape_prefixed(bytes, i) => {
                begin = i - 1;
                Some((
                    SegmentKind::EscapeLiteral,
                    escape_literal_end(bytes, i).ok_or(LexError::UnterminatedLiteral)?,
                ))
            }
            b'\'' => Some((
                SegmentKind::Literal,
                quoted_end(bytes, i, b'\'').ok_or(LexError::UnterminatedLiteral)?,
            )),
            b'"' => Some((
                SegmentKind::QuotedIdent,
                quoted_end(bytes, i, b'"').ok_or(LexError::UnterminatedIdentifier)?,
            )),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|offset| i + offset)
                    .unwrap_or(bytes.len());
                Some((SegmentKind::Comment, end))
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => Some((
                SegmentKind::Comment,
                block_comment_end(bytes, i).ok_or(LexError::UnterminatedComment)?,
            )),
            b'$' => match dollar_tag(bytes, i) {
                Some(tag_len) => Some((
                    SegmentKind::DollarQuoted,
                    dollar_end(bytes, i, tag_len).ok_or(LexError::UnterminatedDollarQuote)?,
                )),
                None => None,
            },
            _ => None,
        };

        match special {
            Some((kind, end)) => {
                if code_start < begin {
                    segments.push(Segment {
                        kind: SegmentKind::Code,
                        text: &sql[code_start..begin],
                    });
                }
                segments.push(Segment {
                    kind,
                    text: &sql[begin..end],
                });
                i = end;
                code_start = end;
            }
            None => i += 1,
        }
    }
    if code_start < bytes.len() {
        segments.push(Segment {
            kind: SegmentKind::Code,
            text: &sql[code_start..],
        });
    }
    Ok(segments)
}

/// End offset (exclusive) of a quoted region starting at `start`, treating a
/// doubled quote as an escape.
fn quoted_end(bytes: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Whether the quote at `quote` opens an `E'...'` string: it follows an `e`
/// or `E` that is not the tail of a longer identifier.
fn escape_prefixed(bytes: &[u8], quote: usize) -> bool {
    if quote == 0 || !matches!(bytes[quote - 1], b'e' | b'E') {
        return false;
    }
    match quote.checked_sub(2).map(|at| bytes[at]) {
        Some(prev) => !(prev.is_ascii_alphanumeric() || prev == b'_' || prev == b'$' || prev >= 0x80),
        None => true,
    }
}

/// End offset (exclusive) of an escape string whose opening quote is at
/// `start`. A backslash escapes the next byte, `''` is still a quote.
fn escape_literal_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Block comments nest.
fn block_comment_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => i += 1,
        }
    }
    None
}

/// Length of a `$tag$` opener at `start`, or `None` when the `$` is a
/// positional parameter or part of an identifier.
fn dollar_tag(bytes: &[u8], start: usize) -> Option<usize> {
    if start > 0 {
        let prev = bytes[start - 1];
        if prev.is_ascii_alphanumeric() || prev == b'_' || prev == b'$' {
            return None;
        }
    }
    let mut i = start + 1;
    if i < bytes.len() && bytes[i].is_ascii_digit() {
        return None;
    }
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    (bytes.get(i) == Some(&b'$')).then_some(i + 1 - start)
}

fn dollar_end(bytes: &[u8], start: usize, tag_len: usize) -> Option<usize> {
    let tag = &bytes[start..start + tag_len];
    let body = start + tag_len;
    bytes[body..]
        .windows(tag_len)
        .position(|window| window == tag)
        .map(|offset| body + offset + tag_len)
}
