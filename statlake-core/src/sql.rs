//! SQL handling on top of `sqlparser`, DuckDB dialect.
//!
//! Anonymous `?` placeholders are numbered (`$1`, `$2`, ...) in textual order
//! before parsing, so a statement can be rewritten and rendered again while
//! its positional parameters keep their binding.

use sqlparser::ast::{visit_statements, Query, Statement};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::{Token, Tokenizer, TokenizerError};
use std::fmt::Write as _;
use std::ops::ControlFlow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("cannot tokenize SQL: {0}")]
    Tokenize(#[from] TokenizerError),

    #[error("cannot parse SQL: {0}")]
    Parse(#[from] ParserError),

    #[error("expected a single statement, found {0}")]
    StatementCount(usize),

    #[error("expected a query, found another statement")]
    NotAQuery,

    #[error("placeholders mix anonymous `?` and numbered `$n` styles")]
    MixedPlaceholders,
}

/// SQL text with every placeholder numbered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberedSql {
    pub sql: String,
    /// Parameters the statement binds.
    pub params: usize,
}

/// Tokens with escapes left as written, so rendering them reproduces the input.
fn tokens(sql: &str) -> Result<Vec<Token>, TokenizerError> {
    Tokenizer::new(&DuckDbDialect {}, sql)
        .with_unescape(false)
        .tokenize()
}

/// Collapse whitespace and comments outside literals to single spaces, trim,
/// and strip trailing semicolons. Text that does not tokenize is only trimmed.
pub fn normalize(sql: &str) -> String {
    let Ok(tokens) = tokens(sql) else {
        return sql.trim().to_string();
    };
    let end = tokens
        .iter()
        .rposition(|t| !matches!(t, Token::Whitespace(_) | Token::SemiColon | Token::EOF))
        .map_or(0, |i| i + 1);

    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;
    for token in &tokens[..end] {
        match token {
            Token::Whitespace(_) => pending_space = true,
            Token::EOF => {}
            other => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                let _ = write!(out, "{other}");
            }
        }
    }
    out
}

/// Position of a numbered placeholder (`$3` or `?3` is 3).
pub fn placeholder_index(placeholder: &str) -> Option<usize> {
    placeholder
        .get(1..)
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| digits.parse().ok())
}

/// Replace each anonymous `?` with `$k`, counting in textual order.
///
/// Already-numbered placeholders are kept and the parameter count is the
/// highest index. Mixing both styles is an error.
pub fn number_placeholders(sql: &str) -> Result<NumberedSql, SqlError> {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut anonymous = 0usize;
    let mut highest = 0usize;

    for token in tokens(sql)? {
        match &token {
            Token::Placeholder(p) if p == "?" => {
                anonymous += 1;
                let _ = write!(out, "${anonymous}");
            }
            Token::Placeholder(p) => {
                if let Some(n) = placeholder_index(p) {
                    highest = highest.max(n);
                }
                out.push_str(p);
            }
            Token::EOF => {}
            other => {
                let _ = write!(out, "{other}");
            }
        }
    }

    if anonymous > 0 && highest > 0 {
        return Err(SqlError::MixedPlaceholders);
    }
    Ok(NumberedSql {
        sql: out,
        params: anonymous.max(highest),
    })
}

/// Parse exactly one statement.
pub fn parse_single(sql: &str) -> Result<Statement, SqlError> {
    let mut statements = Parser::parse_sql(&DuckDbDialect {}, sql)?;
    if statements.len() != 1 {
        return Err(SqlError::StatementCount(statements.len()));
    }
    statements.pop().ok_or(SqlError::StatementCount(0))
}

/// Parse one `SELECT`-style query.
pub fn parse_query(sql: &str) -> Result<Box<Query>, SqlError> {
    match parse_single(sql)? {
        Statement::Query(query) => Ok(query),
        _ => Err(SqlError::NotAQuery),
    }
}

/// Whether `statement` only reads: a query, `EXPLAIN` of one, or `DESCRIBE`.
///
/// Nested statements count too, so `EXPLAIN ANALYZE DELETE ...` and
/// data-modifying CTEs are writes.
pub fn is_read_only(statement: &Statement) -> bool {
    let flow = visit_statements(statement, |s| match s {
        Statement::Query(_) | Statement::Explain { .. } | Statement::ExplainTable { .. } => {
            ControlFlow::Continue(())
        }
        _ => ControlFlow::Break(()),
    });
    flow.is_continue()
}
