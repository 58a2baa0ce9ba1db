use crate::error::{Error, Result};

use lazy_static::lazy_static;
use regex::{Captures, Regex};

/// The kind of an SQL statement, as far as the connection cares.
#[derive(Clone, Debug, PartialEq)]
pub enum StatementKind {
    /// A statement handled entirely on the client, never sent to the backend.
    Directive(Directive),
    Query,
    Dml,
    Ddl,
}

/// Client-side directives, each mapped to a connection state transition.
#[derive(Clone, Debug, PartialEq)]
pub enum Directive {
    SetAutocommit(bool),
    SetReadOnly(bool),
    SetRetryAbortsInternally(bool),
    SetTransactionTag(String),
    SetStatementTag(String),
    StartBatchDdl,
    StartBatchDml,
    RunBatch,
    AbortBatch,
    ShowVariable(String),
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
}

/// Classifies SQL text. Parsing proper is left to the backend.
pub trait StatementClassifier: Send {
    fn classify(&self, sql: &str) -> Result<StatementKind>;
}

lazy_static! {
    static ref SET_AUTOCOMMIT: Regex = directive(r"SET\s+AUTOCOMMIT\s*=\s*(TRUE|FALSE)");
    static ref SET_READONLY: Regex = directive(r"SET\s+READONLY\s*=\s*(TRUE|FALSE)");
    static ref SET_RETRY: Regex = directive(r"SET\s+RETRY_ABORTS_INTERNALLY\s*=\s*(TRUE|FALSE)");
    static ref SET_TRANSACTION_TAG: Regex =
        directive(r"SET\s+TRANSACTION_TAG\s*=\s*'((?:[^']|'')*)'");
    static ref SET_STATEMENT_TAG: Regex = directive(r"SET\s+STATEMENT_TAG\s*=\s*'((?:[^']|'')*)'");
    static ref START_BATCH: Regex = directive(r"START\s+BATCH\s+(DDL|DML)");
    static ref RUN_BATCH: Regex = directive(r"RUN\s+BATCH");
    static ref ABORT_BATCH: Regex = directive(r"ABORT\s+BATCH");
    static ref SHOW_VARIABLE: Regex = directive(r"SHOW\s+VARIABLE\s+(\w+)");
    static ref BEGIN: Regex = directive(r"BEGIN(?:\s+TRANSACTION)?");
    static ref COMMIT: Regex = directive(r"COMMIT(?:\s+TRANSACTION)?");
    static ref ROLLBACK_TO: Regex = directive(r"ROLLBACK\s+TO\s+(?:SAVEPOINT\s+)?(\w+)");
    static ref ROLLBACK: Regex = directive(r"ROLLBACK(?:\s+TRANSACTION)?");
    static ref SAVEPOINT: Regex = directive(r"SAVEPOINT\s+(\w+)");
    static ref RELEASE: Regex = directive(r"RELEASE\s+(?:SAVEPOINT\s+)?(\w+)");
    static ref LEADING_COMMENTS: Regex =
        Regex::new(r"^(?s:\s*(?:--[^\n]*(?:\n|$)|/\*.*?\*/))*\s*").unwrap();
    static ref FIRST_WORD: Regex = Regex::new(r"^\(*\s*([A-Za-z]+)").unwrap();
}

/// Builds a case-insensitive, whole-statement directive pattern with an optional trailing
/// semicolon.
fn directive(pattern: &str) -> Regex {
    Regex::new(&format!(r"(?i)^\s*{}\s*;?\s*$", pattern)).unwrap()
}

/// Classifies statements by matching directives first, then by the leading keyword.
#[derive(Clone, Debug, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    fn directive(&self, sql: &str) -> Option<Directive> {
        let flag = |c: Captures| c[1].eq_ignore_ascii_case("TRUE");
        let tag = |c: Captures| c[1].replace("''", "'");
        if let Some(c) = SET_AUTOCOMMIT.captures(sql) {
            Some(Directive::SetAutocommit(flag(c)))
        } else if let Some(c) = SET_READONLY.captures(sql) {
            Some(Directive::SetReadOnly(flag(c)))
        } else if let Some(c) = SET_RETRY.captures(sql) {
            Some(Directive::SetRetryAbortsInternally(flag(c)))
        } else if let Some(c) = SET_TRANSACTION_TAG.captures(sql) {
            Some(Directive::SetTransactionTag(tag(c)))
        } else if let Some(c) = SET_STATEMENT_TAG.captures(sql) {
            Some(Directive::SetStatementTag(tag(c)))
        } else if let Some(c) = START_BATCH.captures(sql) {
            match c[1].eq_ignore_ascii_case("DDL") {
                true => Some(Directive::StartBatchDdl),
                false => Some(Directive::StartBatchDml),
            }
        } else if RUN_BATCH.is_match(sql) {
            Some(Directive::RunBatch)
        } else if ABORT_BATCH.is_match(sql) {
            Some(Directive::AbortBatch)
        } else if let Some(c) = SHOW_VARIABLE.captures(sql) {
            Some(Directive::ShowVariable(c[1].to_uppercase()))
        } else if BEGIN.is_match(sql) {
            Some(Directive::Begin)
        } else if COMMIT.is_match(sql) {
            Some(Directive::Commit)
        } else if let Some(c) = ROLLBACK_TO.captures(sql) {
            Some(Directive::RollbackToSavepoint(c[1].to_owned()))
        } else if ROLLBACK.is_match(sql) {
            Some(Directive::Rollback)
        } else if let Some(c) = SAVEPOINT.captures(sql) {
            Some(Directive::Savepoint(c[1].to_owned()))
        } else {
            RELEASE.captures(sql).map(|c| Directive::ReleaseSavepoint(c[1].to_owned()))
        }
    }
}

impl StatementClassifier for Classifier {
    fn classify(&self, sql: &str) -> Result<StatementKind> {
        if let Some(directive) = self.directive(sql) {
            return Ok(StatementKind::Directive(directive));
        }
        let body = LEADING_COMMENTS.replace(sql, "");
        let keyword = FIRST_WORD
            .captures(&body)
            .map(|c| c[1].to_uppercase())
            .ok_or_else(|| Error::Parse(format!("Unable to classify statement: {}", sql)))?;
        match keyword.as_str() {
            "SELECT" | "WITH" | "VALUES" | "EXPLAIN" | "SHOW" => Ok(StatementKind::Query),
            "INSERT" | "UPDATE" | "DELETE" | "MERGE" => Ok(StatementKind::Dml),
            "CREATE" | "DROP" | "ALTER" | "TRUNCATE" | "GRANT" | "REVOKE" => Ok(StatementKind::Ddl),
            keyword => Err(Error::Parse(format!("Unknown statement type {}", keyword))),
        }
    }
}
