use crate::error::{Error, Result};
use crate::session::{BatchOutcome, Outcome, Statement};
use crate::types::{Columns, Row};

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// An operation executed in a read-write transaction, recorded for replay.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Query(Statement),
    Dml(Statement),
    /// A DML batch run inside the transaction.
    Batch(Vec<Statement>),
}

/// The kind of a buffered operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Dml,
    Batch,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Query(_) => OperationKind::Query,
            Operation::Dml(_) => OperationKind::Dml,
            Operation::Batch(_) => OperationKind::Batch,
        }
    }
}

/// The raw result of running an operation against the backend.
#[derive(Clone, Debug, PartialEq)]
pub enum Output {
    Statement(Outcome),
    Batch(BatchOutcome),
}

/// A lightweight fingerprint of a query result: the row count and a hash over every row.
/// Collisions are accepted in exchange for not retaining result sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checksum {
    pub rows: u64,
    pub hash: u64,
}

impl Checksum {
    pub fn new(columns: &Columns, rows: &[Row]) -> Result<Self> {
        let mut hasher = DefaultHasher::new();
        hasher.write(&bincode::serialize(columns)?);
        for row in rows {
            hasher.write(&bincode::serialize(row)?);
        }
        Ok(Self { rows: rows.len() as u64, hash: hasher.finish() })
    }
}

/// What the caller observed when an operation ran, compared on replay.
#[derive(Clone, Debug, PartialEq)]
pub enum Observed {
    Rows(Checksum),
    Count(u64),
    Done,
    Counts { counts: Vec<u64>, failed: Option<String> },
    /// The operation failed with a statement-level error.
    Error(String),
}

impl Observed {
    /// Records the observable result of an operation. Returns None for results that aren't
    /// observations of the database state (aborts, timeouts, transport and internal errors),
    /// which are never buffered.
    pub fn of(result: &Result<Output>) -> Result<Option<Self>> {
        Ok(Some(match result {
            Ok(Output::Statement(Outcome::Rows { columns, rows })) => {
                Observed::Rows(Checksum::new(columns, rows)?)
            }
            Ok(Output::Statement(Outcome::Count(count))) => Observed::Count(*count),
            Ok(Output::Statement(Outcome::Done)) => Observed::Done,
            Ok(Output::Batch(outcome)) => Observed::Counts {
                counts: outcome.counts.clone(),
                failed: outcome.error.as_ref().map(|e| e.to_string()),
            },
            Err(err @ (Error::Value(_) | Error::Parse(_) | Error::ReadOnly)) => {
                Observed::Error(err.to_string())
            }
            Err(_) => return Ok(None),
        }))
    }
}

/// An operation recorded in the transaction buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferedOperation {
    pub sequence: u64,
    pub operation: Operation,
    pub observed: Observed,
}

impl BufferedOperation {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

/// The ordered operations of the current read-write transaction.
#[derive(Debug, Default)]
pub struct TransactionBuffer {
    operations: Vec<BufferedOperation>,
    next_sequence: u64,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation, returning its sequence number.
    pub fn push(&mut self, operation: Operation, observed: Observed) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.operations.push(BufferedOperation { sequence, operation, observed });
        sequence
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[BufferedOperation] {
        &self.operations
    }

    pub(crate) fn operations_mut(&mut self) -> &mut [BufferedOperation] {
        &mut self.operations
    }

    /// Drops every operation at or after the given position.
    pub fn truncate(&mut self, position: usize) {
        self.operations.truncate(position);
    }

    pub fn clear(&mut self) {
        self.operations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn rows(values: &[i64]) -> Output {
        Output::Statement(Outcome::Rows {
            columns: vec!["x".into()],
            rows: values.iter().map(|v| vec![Value::Integer(*v)]).collect(),
        })
    }

    #[test]
    fn checksum() -> Result<()> {
        let a = Observed::of(&Ok(rows(&[1, 2, 3])))?;
        assert_eq!(a, Observed::of(&Ok(rows(&[1, 2, 3])))?);
        assert_ne!(a, Observed::of(&Ok(rows(&[1, 3, 2])))?);
        assert_ne!(a, Observed::of(&Ok(rows(&[1, 2])))?);
        match a {
            Some(Observed::Rows(checksum)) => assert_eq!(3, checksum.rows),
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn observations() -> Result<()> {
        assert_eq!(
            Some(Observed::Count(3)),
            Observed::of(&Ok(Output::Statement(Outcome::Count(3))))?
        );
        assert_eq!(
            Some(Observed::Error("boom".into())),
            Observed::of(&Err(Error::Value("boom".into())))?
        );
        assert_eq!(None, Observed::of(&Err(Error::Abort))?);
        assert_eq!(None, Observed::of(&Err(Error::Timeout))?);
        assert_eq!(
            Some(Observed::Counts { counts: vec![1], failed: Some("bad".into()) }),
            Observed::of(&Ok(Output::Batch(BatchOutcome {
                counts: vec![1],
                error: Some(Error::Value("bad".into())),
            })))?
        );
        Ok(())
    }

    #[test]
    fn buffer() {
        let mut buffer = TransactionBuffer::new();
        for i in 0..4 {
            let sql = format!("UPDATE t SET x = {}", i);
            let op = Operation::Dml(Statement::new(sql, vec![]));
            assert_eq!(i, buffer.push(op, Observed::Count(1)));
        }
        buffer.truncate(2);
        assert_eq!(2, buffer.len());
        let sequences: Vec<u64> = buffer.operations().iter().map(|op| op.sequence).collect();
        assert_eq!(vec![0, 1], sequences);
        // Sequence numbers keep increasing after a truncation.
        let op = Operation::Query(Statement::new("SELECT 1", vec![]));
        assert_eq!(4, buffer.push(op, Observed::Done));
        assert_eq!(OperationKind::Query, buffer.operations()[2].kind());
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
