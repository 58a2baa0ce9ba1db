use super::state::BatchMode;
use crate::error::{Error, Result};
use crate::session::{with_timeout, BackendSession, BatchOutcome, Statement};

use log::debug;
use std::time::Duration;

/// Statements accumulated by an open batch.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchBuffer {
    Ddl(Vec<String>),
    Dml(Vec<Statement>),
}

impl BatchBuffer {
    pub fn mode(&self) -> BatchMode {
        match self {
            BatchBuffer::Ddl(_) => BatchMode::Ddl,
            BatchBuffer::Dml(_) => BatchMode::Dml,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BatchBuffer::Ddl(statements) => statements.len(),
            BatchBuffer::Dml(statements) => statements.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffers the statements of a DDL or DML batch between START BATCH and RUN/ABORT BATCH.
#[derive(Debug, Default)]
pub struct BatchExecutor {
    buffer: Option<BatchBuffer>,
}

impl BatchExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered statements.
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, BatchBuffer::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn start(&mut self, mode: BatchMode) -> Result<()> {
        if self.buffer.is_some() {
            return Err(Error::InvalidState("a DML or DDL batch has already been started".into()));
        }
        self.buffer = match mode {
            BatchMode::Ddl => Some(BatchBuffer::Ddl(Vec::new())),
            BatchMode::Dml => Some(BatchBuffer::Dml(Vec::new())),
            BatchMode::None => return Err(Error::Internal("No batch kind given".into())),
        };
        Ok(())
    }

    pub fn add_ddl(&mut self, sql: &str) -> Result<()> {
        match &mut self.buffer {
            Some(BatchBuffer::Ddl(statements)) => {
                statements.push(sql.to_owned());
                Ok(())
            }
            Some(BatchBuffer::Dml(_)) => Err(Error::InvalidBatchState(
                "DDL statements are not allowed in a DML batch".into(),
            )),
            None => Err(Error::InvalidState("No batch is active".into())),
        }
    }

    pub fn add_dml(&mut self, statement: Statement) -> Result<()> {
        match &mut self.buffer {
            Some(BatchBuffer::Dml(statements)) => {
                statements.push(statement);
                Ok(())
            }
            Some(BatchBuffer::Ddl(_)) => Err(Error::InvalidBatchState(
                "DML statements are not allowed in a DDL batch".into(),
            )),
            None => Err(Error::InvalidState("No batch is active".into())),
        }
    }

    /// Ends the batch, handing over its statements for submission.
    pub fn take(&mut self) -> Result<BatchBuffer> {
        self.buffer.take().ok_or_else(|| Error::InvalidState("No batch is active".into()))
    }

    /// Ends the batch, discarding its statements. Returns how many were discarded.
    pub fn abort(&mut self) -> Result<usize> {
        let buffer = self.take()?;
        debug!("Aborted {} batch of {} statements", buffer.mode(), buffer.len());
        Ok(buffer.len())
    }

    /// Drops any open batch.
    pub fn clear(&mut self) {
        self.buffer = None;
    }
}

/// Submits DDL statements as one schema change. A failure at index k means the first k
/// statements were applied and the rest were not.
pub async fn run_ddl<B: BackendSession>(
    backend: &mut B,
    statements: Vec<String>,
    timeout: Option<Duration>,
) -> Result<Vec<u64>> {
    if statements.is_empty() {
        return Ok(Vec::new());
    }
    debug!("Submitting DDL batch of {} statements", statements.len());
    let outcome = with_timeout(timeout, backend.submit_ddl_batch(statements)).await?;
    match outcome.error {
        None => Ok(outcome.counts),
        Some(err) => Err(Error::BatchPartialFailure {
            applied: outcome.counts.len(),
            message: err.to_string(),
        }),
    }
}

/// Converts a DML batch outcome into its row counts, or the error carrying the counts of
/// the statements that completed before the failing one.
pub fn dml_result(outcome: BatchOutcome) -> Result<Vec<u64>> {
    match outcome.error {
        None => Ok(outcome.counts),
        Some(err) => Err(Error::BatchUpdate { counts: outcome.counts, message: err.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Memory;

    #[test]
    fn buffering() -> Result<()> {
        let mut batch = BatchExecutor::new();
        assert!(batch.is_empty());
        assert!(matches!(batch.add_ddl("CREATE TABLE t"), Err(Error::InvalidState(_))));

        batch.start(BatchMode::Dml)?;
        assert!(matches!(batch.start(BatchMode::Ddl), Err(Error::InvalidState(_))));
        batch.add_dml(Statement::new("INSERT INTO t VALUES (1, 1)", vec![]))?;
        assert!(matches!(batch.add_ddl("CREATE TABLE t"), Err(Error::InvalidBatchState(_))));
        assert_eq!(1, batch.len());
        assert_eq!(1, batch.abort()?);
        assert!(batch.is_empty());
        assert!(matches!(batch.abort(), Err(Error::InvalidState(_))));

        batch.start(BatchMode::Ddl)?;
        batch.add_ddl("CREATE TABLE a")?;
        assert!(matches!(
            batch.add_dml(Statement::new("DELETE FROM a", vec![])),
            Err(Error::InvalidBatchState(_))
        ));
        assert_eq!(BatchBuffer::Ddl(vec!["CREATE TABLE a".into()]), batch.take()?);
        assert!(matches!(batch.take(), Err(Error::InvalidState(_))));
        Ok(())
    }

    #[tokio::test]
    async fn ddl() -> Result<()> {
        let mut db = Memory::new();
        assert_eq!(Vec::<u64>::new(), run_ddl(&mut db, vec![], None).await?);
        assert_eq!(0, db.stats()?.executed.len());

        db.fail_ddl_batch_at(2)?;
        let statements = ["CREATE TABLE a", "CREATE TABLE b", "CREATE TABLE c", "CREATE TABLE d"];
        let statements = statements.iter().map(|s| s.to_string()).collect();
        let result = run_ddl(&mut db, statements, None).await;
        match result {
            Err(Error::BatchPartialFailure { applied, .. }) => assert_eq!(2, applied),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(vec!["a".to_string(), "b".to_string()], db.tables()?);
        Ok(())
    }

    #[test]
    fn dml() {
        assert_eq!(Ok(vec![1, 2]), dml_result(BatchOutcome::success(vec![1, 2])));
        let outcome = BatchOutcome { counts: vec![3], error: Some(Error::Value("dup".into())) };
        assert_eq!(
            Err(Error::BatchUpdate { counts: vec![3], message: "dup".into() }),
            dml_result(outcome)
        );
    }
}
