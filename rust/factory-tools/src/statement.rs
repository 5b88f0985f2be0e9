//! Lexical read/write gate for caller-supplied SQL.
//!
//! Only the leading keyword is inspected. Trailing statements, verbs hidden
//! behind comments and side-effecting functions inside a `SELECT` all pass;
//! this is a coarse guard and not a parser.

use crate::error::{Result, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Read,
    Write,
    Rejected,
}

pub fn classify(sql: &str) -> StatementClass {
    let lowered = sql.trim_start().to_lowercase();
    let verb = lowered
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or_default();

    match verb {
        "select" => StatementClass::Read,
        "insert" | "update" | "delete" => StatementClass::Write,
        _ => StatementClass::Rejected,
    }
}

/// Accepts `sql` only when its class matches what the calling tool allows.
pub fn admit(sql: &str, expected: StatementClass) -> Result<StatementClass> {
    let class = classify(sql);
    if class != StatementClass::Rejected && class == expected {
        return Ok(class);
    }

    let message = match expected {
        StatementClass::Read => "Only SELECT queries are allowed with the query tool",
        StatementClass::Write => {
            "Only INSERT, UPDATE, and DELETE queries are allowed with the execute tool"
        }
        StatementClass::Rejected => "statement rejected",
    };
    Err(ServiceError::RejectedStatement(message.to_string()))
}
