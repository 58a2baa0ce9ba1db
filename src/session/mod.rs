mod memory;

pub use memory::{Memory, Stats};

use crate::error::{Error, Result};
use crate::types::{Columns, Row, Value};

use serde_derive::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// A handle to a transaction open in a backend session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnHandle {
    pub id: u64,
    pub read_only: bool,
}

/// An SQL statement with its bound parameters, as sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Request tag attached to the statement, if any.
    pub tag: Option<String>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self { sql: sql.into(), params, tag: None }
    }

    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }
}

/// The outcome of a single statement executed by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Materialized query rows.
    Rows { columns: Columns, rows: Vec<Row> },
    /// Rows affected by a DML statement.
    Count(u64),
    /// The statement produced no result.
    Done,
}

/// The outcome of a batch submission. Statements are executed in order until the first
/// failure: `counts` has one entry per statement that completed, and `error` is the failure
/// of the statement at index `counts.len()`, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub counts: Vec<u64>,
    pub error: Option<Error>,
}

impl BatchOutcome {
    pub fn success(counts: Vec<u64>) -> Self {
        Self { counts, error: None }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A session with the remote database, capable of running transactions. Abort signals are
/// reported as `Error::Abort`, see `Error::is_abort()`.
pub trait BackendSession: Send {
    /// Begins a new transaction, optionally tagged.
    fn begin(
        &mut self,
        read_only: bool,
        tag: Option<String>,
    ) -> impl Future<Output = Result<TxnHandle>> + Send;

    /// Executes a query, DML or DDL statement in a transaction.
    fn execute(
        &mut self,
        txn: TxnHandle,
        statement: Statement,
    ) -> impl Future<Output = Result<Outcome>> + Send;

    /// Commits a transaction. The transaction is closed whatever the outcome.
    fn commit(&mut self, txn: TxnHandle) -> impl Future<Output = Result<()>> + Send;

    /// Rolls back a transaction. Rolling back an unknown or finished transaction is a no-op.
    fn rollback(&mut self, txn: TxnHandle) -> impl Future<Output = Result<()>> + Send;

    /// Submits DDL statements as a single schema change request, outside any transaction.
    fn submit_ddl_batch(
        &mut self,
        statements: Vec<String>,
    ) -> impl Future<Output = Result<BatchOutcome>> + Send;

    /// Submits DML statements for execution in a transaction, in order.
    fn submit_dml_batch(
        &mut self,
        txn: TxnHandle,
        statements: Vec<Statement>,
    ) -> impl Future<Output = Result<BatchOutcome>> + Send;
}

/// Bounds a backend call by an optional timeout.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, future).await?,
        None => future.await,
    }
}
