//! SQL text utilities: scanning, filter validation, statement splitting and
//! the canonical statement builders.
pub mod builder;
pub mod filter;
pub mod lexer;
pub mod split;

pub use builder::{quote_ident, SortOrder, Statement};
pub use filter::validate_filter;
pub use split::{alters_session, returns_rows, split_statements};
