use std::path::Path;

use anyhow::{Context, Result};

const AUTOCOMMIT_PREFIX: &str = "REFRESH MATERIALIZED VIEW CONCURRENTLY";

/// How a statement must be executed relative to the surrounding transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementMode {
    Transactional,
    /// Statements PostgreSQL refuses inside a transaction block.
    Autocommit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    pub sql: String,
    pub mode: StatementMode,
}

/// A parsed multi-statement SQL file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    pub name: String,
    pub statements: Vec<SqlStatement>,
}

impl SqlScript {
    pub fn parse(name: impl Into<String>, text: &str) -> Self {
        let statements = split_statements(text)
            .into_iter()
            .map(|sql| {
                let mode = if requires_autocommit(&sql) {
                    StatementMode::Autocommit
                } else {
                    StatementMode::Transactional
                };
                SqlStatement { sql, mode }
            })
            .collect();
        Self {
            name: name.into(),
            statements,
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading SQL script {}", path.display()))?;
        Ok(Self::parse(path.display().to_string(), &text))
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Splits on top-level semicolons. Quoted strings, quoted identifiers, comments and
/// dollar-quoted bodies are kept intact; comment-only fragments are dropped.
pub fn split_statements(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = match bytes[i..].iter().position(|b| *b == b'\n') {
                    Some(offset) => i + offset + 1,
                    None => bytes.len(),
                };
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = match text[i + 2..].find("*/") {
                    Some(offset) => i + 2 + offset + 2,
                    None => bytes.len(),
                };
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(tag_len) => {
                    let tag = &text[i..i + tag_len];
                    let body = i + tag_len;
                    i = match text[body..].find(tag) {
                        Some(offset) => body + offset + tag_len,
                        None => bytes.len(),
                    };
                }
                None => i += 1,
            },
            b';' => {
                push_statement(&mut statements, &text[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    push_statement(&mut statements, &text[start..]);
    statements
}

/// Index just past the closing quote; doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Length of a `$tag$` opener at `at`, if any. Positional parameters like `$1` are not tags.
fn dollar_tag(bytes: &[u8], at: usize) -> Option<usize> {
    let mut i = at + 1;
    if bytes.get(i).is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    while let Some(&b) = bytes.get(i) {
        if b == b'$' {
            return Some(i - at + 1);
        }
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        i += 1;
    }
    None
}

fn push_statement(statements: &mut Vec<String>, fragment: &str) {
    let trimmed = fragment.trim();
    if !strip_leading_comments(trimmed).is_empty() {
        statements.push(trimmed.to_string());
    }
}

fn strip_leading_comments(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            return sql;
        }
    }
}

fn requires_autocommit(sql: &str) -> bool {
    let normalized = strip_leading_comments(sql)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    normalized.starts_with(AUTOCOMMIT_PREFIX)
}
