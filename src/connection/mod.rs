mod batch;
mod buffer;
mod retry;
mod savepoint;
mod state;

pub use batch::{BatchBuffer, BatchExecutor};
pub use buffer::{
    BufferedOperation, Checksum, Observed, Operation, OperationKind, Output, TransactionBuffer,
};
pub use retry::{Replay, RetryAttempt, RetryCycle, RetryEngine, RetryPolicy, RetryStats};
pub use savepoint::{Savepoint, SavepointManager};
pub use state::{BatchMode, ConnectionState, Phase, TransactionMode};

use crate::classifier::{Classifier, Directive, StatementClassifier, StatementKind};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::session::{with_timeout, BackendSession, Outcome, Statement, TxnHandle};
use crate::types::{ResultSet, Value};

use log::{debug, warn};
use std::time::Duration;

/// An open backend transaction, with what is needed to replay it.
#[derive(Debug)]
struct Transaction {
    handle: TxnHandle,
    /// Operations to replay. Always empty for read-only transactions.
    buffer: TransactionBuffer,
    savepoints: SavepointManager,
    tag: Option<String>,
}

/// A connection to the database, running statements in autocommit mode or in explicit
/// transactions and hiding backend aborts of read-write transactions from the caller.
///
/// A connection serves one caller at a time: every operation takes `&mut self` and runs to
/// completion, including any retries, before returning.
pub struct Connection<B: BackendSession, C: StatementClassifier = Classifier> {
    backend: B,
    classifier: C,
    state: ConnectionState,
    txn: Option<Transaction>,
    batch: BatchExecutor,
    retry: RetryEngine,
    timeout: Option<Duration>,
    closed: bool,
}

impl<B: BackendSession> Connection<B> {
    /// Creates a connection over a backend session, using the built-in statement classifier.
    pub fn new(backend: B, config: &ConnectionConfig) -> Self {
        Self::with_classifier(backend, Classifier::new(), config)
    }
}

impl<B: BackendSession, C: StatementClassifier> Connection<B, C> {
    pub fn with_classifier(backend: B, classifier: C, config: &ConnectionConfig) -> Self {
        let timeout = config.statement_timeout();
        Self {
            backend,
            classifier,
            state: ConnectionState::new(config),
            txn: None,
            batch: BatchExecutor::new(),
            retry: RetryEngine::new(config.retry.clone(), timeout),
            timeout,
            closed: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        match self.closed {
            true => Phase::Closed,
            false => self.state.phase(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn retry_stats(&self) -> &RetryStats {
        self.retry.stats()
    }

    /// The operations buffered by the current read-write transaction.
    pub fn buffered_operations(&self) -> &[BufferedOperation] {
        match &self.txn {
            Some(txn) => txn.buffer.operations(),
            None => &[],
        }
    }

    /// Names of the live savepoints of the current transaction, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.txn.as_ref().map_or_else(Vec::new, |txn| txn.savepoints.names())
    }

    /// Number of statements in the open batch.
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn ensure_open(&self) -> Result<()> {
        match self.closed {
            true => Err(Error::Closed),
            false => Ok(()),
        }
    }

    /// Executes an SQL statement or client-side directive.
    pub async fn execute(&mut self, sql: &str, params: Vec<Value>) -> Result<ResultSet> {
        self.ensure_open()?;
        let kind = self.classifier.classify(sql)?;
        debug!("Executing {:?} in {} phase: {}", kind, self.phase(), sql);
        match kind {
            StatementKind::Directive(directive) => self.apply(directive).await,
            StatementKind::Query if self.state.in_batch() => Err(Error::InvalidBatchState(format!(
                "Queries are not allowed in a {} batch",
                self.state.batch_mode
            ))),
            StatementKind::Query => {
                let statement = self.statement(sql, params);
                self.query(statement).await
            }
            StatementKind::Dml => {
                let statement = self.statement(sql, params);
                match self.state.batch_mode {
                    BatchMode::None => self.dml(statement).await,
                    _ => {
                        self.batch.add_dml(statement)?;
                        Ok(ResultSet::Empty)
                    }
                }
            }
            StatementKind::Ddl if !params.is_empty() => {
                Err(Error::Value("DDL statements don't take parameters".into()))
            }
            StatementKind::Ddl => match self.state.batch_mode {
                BatchMode::None => self.ddl(sql).await,
                _ => {
                    self.batch.add_ddl(sql)?;
                    Ok(ResultSet::Empty)
                }
            },
        }
    }

    async fn apply(&mut self, directive: Directive) -> Result<ResultSet> {
        match directive {
            Directive::SetAutocommit(enabled) => self.set_autocommit(enabled).await?,
            Directive::SetReadOnly(enabled) => self.set_read_only(enabled).await?,
            Directive::SetRetryAbortsInternally(enabled) => {
                self.set_retry_aborts_internally(enabled)?
            }
            Directive::SetTransactionTag(tag) => self.set_transaction_tag(&tag)?,
            Directive::SetStatementTag(tag) => self.set_statement_tag(&tag)?,
            Directive::StartBatchDdl => self.start_batch_ddl()?,
            Directive::StartBatchDml => self.start_batch_dml()?,
            Directive::RunBatch => {
                return self.run_batch().await.map(|counts| ResultSet::Batch { counts })
            }
            Directive::AbortBatch => self.abort_batch()?,
            Directive::ShowVariable(name) => {
                let value = self.show_variable(&name)?;
                return Ok(ResultSet::from_rows(vec![name], vec![vec![value]]));
            }
            Directive::Begin => self.begin().await?,
            Directive::Commit => self.commit().await?,
            Directive::Rollback => self.rollback().await?,
            Directive::Savepoint(name) => self.set_savepoint(&name).await?,
            Directive::RollbackToSavepoint(name) => self.rollback_to_savepoint(&name).await?,
            Directive::ReleaseSavepoint(name) => self.release_savepoint(&name)?,
        }
        Ok(ResultSet::Empty)
    }

    /// Enables or disables autocommit. Any open transaction without buffered work is
    /// committed first.
    pub async fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("change autocommit")?;
        self.finish_idle_transaction("change autocommit").await?;
        self.state.autocommit = enabled;
        Ok(())
    }

    /// Switches read-only mode. Read-only transactions are never buffered or retried.
    pub async fn set_read_only(&mut self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("change read-only mode")?;
        self.finish_idle_transaction("change read-only mode").await?;
        self.state.read_only = enabled;
        Ok(())
    }

    pub fn set_retry_aborts_internally(&mut self, enabled: bool) -> Result<()> {
        self.ensure_open()?;
        if self.state.in_transaction() {
            return Err(Error::InvalidState(
                "Cannot change retry mode while a transaction is active".into(),
            ));
        }
        self.state.retry_enabled = enabled;
        Ok(())
    }

    /// Tags the next transaction. An empty tag clears it.
    pub fn set_transaction_tag(&mut self, tag: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.check_transaction_tag()?;
        self.state.transaction_tag = Some(tag.to_owned()).filter(|t| !t.is_empty());
        Ok(())
    }

    /// Tags the next statement. An empty tag clears it.
    pub fn set_statement_tag(&mut self, tag: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.statement_tag = Some(tag.to_owned()).filter(|t| !t.is_empty());
        Ok(())
    }

    pub fn show_variable(&self, name: &str) -> Result<Value> {
        self.ensure_open()?;
        let name = name.to_uppercase();
        match name.as_str() {
            "RETRY_ATTEMPTS" => Ok(Value::Integer(self.retry.stats().attempts as i64)),
            _ => self
                .state
                .variable(&name)
                .ok_or_else(|| Error::Value(format!("Unknown variable {}", name))),
        }
    }

    /// Commits an open transaction that has no buffered work, or refuses the action.
    async fn finish_idle_transaction(&mut self, action: &str) -> Result<()> {
        if let Some(txn) = &self.txn {
            if !txn.buffer.is_empty() {
                return Err(Error::InvalidState(format!(
                    "Cannot {} while a transaction has uncommitted work",
                    action
                )));
            }
            self.commit_transaction().await?;
        }
        Ok(())
    }

    fn statement(&mut self, sql: &str, params: Vec<Value>) -> Statement {
        Statement::new(sql, params).with_tag(self.state.take_statement_tag())
    }

    async fn query(&mut self, statement: Statement) -> Result<ResultSet> {
        if self.txn.is_none() && self.state.autocommit {
            // A single-use read-only transaction, which has nothing to retry.
            let handle = with_timeout(self.timeout, self.backend.begin(true, None)).await?;
            return match with_timeout(self.timeout, self.backend.execute(handle, statement)).await
            {
                Ok(outcome) => {
                    with_timeout(self.timeout, self.backend.commit(handle)).await?;
                    Ok(Self::result_set(Output::Statement(outcome)))
                }
                Err(err) => {
                    self.rollback_handle(handle).await;
                    Err(err)
                }
            };
        }
        let handle = self.ensure_transaction().await?;
        let output = match handle.read_only {
            true => with_timeout(self.timeout, self.backend.execute(handle, statement))
                .await
                .map(Output::Statement)?,
            false => self.run_buffered(Operation::Query(statement)).await?,
        };
        Ok(Self::result_set(output))
    }

    async fn dml(&mut self, statement: Statement) -> Result<ResultSet> {
        if self.state.read_only {
            return Err(Error::ReadOnly);
        }
        if self.txn.is_none() && self.state.autocommit {
            self.begin_transaction(false).await?;
            return match self.run_buffered(Operation::Dml(statement)).await {
                Ok(output) => {
                    self.commit_transaction().await?;
                    Ok(Self::result_set(output))
                }
                Err(err) => {
                    self.discard_transaction().await;
                    Err(err)
                }
            };
        }
        if self.ensure_transaction().await?.read_only {
            return Err(Error::ReadOnly);
        }
        let output = self.run_buffered(Operation::Dml(statement)).await?;
        Ok(Self::result_set(output))
    }

    /// Runs a DDL statement outside any transaction, as a single-statement schema change.
    async fn ddl(&mut self, sql: &str) -> Result<ResultSet> {
        if self.state.read_only {
            return Err(Error::ReadOnly);
        }
        if self.txn.as_ref().map_or(false, |txn| !txn.buffer.is_empty()) {
            return Err(Error::InvalidState(
                "DDL statements are not allowed while a transaction has uncommitted work".into(),
            ));
        }
        let outcome =
            with_timeout(self.timeout, self.backend.submit_ddl_batch(vec![sql.to_owned()])).await?;
        match outcome.error {
            Some(err) => Err(err),
            None => Ok(ResultSet::Empty),
        }
    }

    fn result_set(output: Output) -> ResultSet {
        match output {
            Output::Statement(Outcome::Rows { columns, rows }) => {
                ResultSet::from_rows(columns, rows)
            }
            Output::Statement(Outcome::Count(count)) => ResultSet::Update { count },
            Output::Statement(Outcome::Done) => ResultSet::Empty,
            Output::Batch(outcome) => ResultSet::Batch { counts: outcome.counts },
        }
    }

    async fn begin_transaction(&mut self, read_only: bool) -> Result<TxnHandle> {
        let tag = self.state.transaction_tag.clone();
        let handle = with_timeout(self.timeout, self.backend.begin(read_only, tag.clone())).await?;
        debug!("Began transaction {} (read_only={})", handle.id, read_only);
        self.state.transaction_mode = match read_only {
            true => TransactionMode::ReadOnly,
            false => TransactionMode::ReadWrite,
        };
        self.txn = Some(Transaction {
            handle,
            buffer: TransactionBuffer::new(),
            savepoints: SavepointManager::new(),
            tag,
        });
        Ok(handle)
    }

    /// Returns the open transaction, beginning one if needed.
    async fn ensure_transaction(&mut self) -> Result<TxnHandle> {
        match &self.txn {
            Some(txn) => Ok(txn.handle),
            None => self.begin_transaction(self.state.read_only).await,
        }
    }

    /// Runs an operation in the open read-write transaction and buffers it. Aborts are
    /// handed to the retry engine, after which the operation is run again in the new
    /// transaction.
    async fn run_buffered(&mut self, operation: Operation) -> Result<Output> {
        let mut cycle = None;
        loop {
            let txn = self
                .txn
                .as_mut()
                .ok_or_else(|| Error::Internal("No active transaction".into()))?;
            let result = retry::run(&mut self.backend, txn.handle, &operation, self.timeout).await;
            match result {
                Err(Error::Abort) if self.state.retry_enabled => {
                    warn!("Transaction {} aborted, retrying", txn.handle.id);
                    let cycle = self.retry.abort(&mut cycle);
                    let restarted = self
                        .retry
                        .restart(
                            &mut self.backend,
                            &mut txn.handle,
                            &mut txn.buffer,
                            txn.tag.as_deref(),
                            cycle,
                            Replay::Verify,
                        )
                        .await;
                    if let Err(err) = restarted {
                        self.discard_transaction().await;
                        return Err(err);
                    }
                }
                Err(Error::Abort) => {
                    self.discard_transaction().await;
                    return Err(Error::Abort);
                }
                result => {
                    if let Some(observed) = Observed::of(&result)? {
                        if cycle.is_some() {
                            self.retry.recovered();
                        }
                        txn.buffer.push(operation, observed);
                    }
                    return result;
                }
            }
        }
    }

    /// Begins an explicit transaction, also in autocommit mode.
    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("begin a transaction")?;
        if self.txn.is_some() {
            return Err(Error::InvalidState("A transaction is already active".into()));
        }
        self.begin_transaction(self.state.read_only).await?;
        Ok(())
    }

    /// Commits the open transaction, if any, retrying it if the commit aborts.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("commit")?;
        self.commit_transaction().await
    }

    /// Rolls back the open transaction, if any.
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("roll back")?;
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        self.end_transaction();
        with_timeout(self.timeout, self.backend.rollback(txn.handle)).await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        let Some(mut txn) = self.txn.take() else {
            return Ok(());
        };
        self.end_transaction();
        if txn.handle.read_only {
            return with_timeout(self.timeout, self.backend.commit(txn.handle)).await;
        }
        let mut cycle = None;
        loop {
            match with_timeout(self.timeout, self.backend.commit(txn.handle)).await {
                Ok(()) => {
                    debug!("Committed transaction {}", txn.handle.id);
                    if cycle.is_some() {
                        self.retry.recovered();
                    }
                    return Ok(());
                }
                Err(Error::Abort) if self.state.retry_enabled => {
                    warn!("Commit of transaction {} aborted, retrying", txn.handle.id);
                    let cycle = self.retry.abort(&mut cycle);
                    let restarted = self
                        .retry
                        .restart(
                            &mut self.backend,
                            &mut txn.handle,
                            &mut txn.buffer,
                            txn.tag.as_deref(),
                            cycle,
                            Replay::Verify,
                        )
                        .await;
                    if let Err(err) = restarted {
                        self.rollback_handle(txn.handle).await;
                        return Err(err);
                    }
                }
                Err(err) => {
                    if !err.is_abort() {
                        self.rollback_handle(txn.handle).await;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Rolls back and drops the open transaction after an unrecoverable failure.
    async fn discard_transaction(&mut self) {
        if let Some(txn) = self.txn.take() {
            self.rollback_handle(txn.handle).await;
        }
        self.end_transaction();
    }

    async fn rollback_handle(&mut self, handle: TxnHandle) {
        if let Err(err) = with_timeout(self.timeout, self.backend.rollback(handle)).await {
            warn!("Failed to roll back transaction {}: {}", handle.id, err);
        }
    }

    fn end_transaction(&mut self) {
        self.state.transaction_mode = TransactionMode::None;
        self.state.transaction_tag = None;
    }

    /// Creates a savepoint at the current position of the transaction. In non-autocommit
    /// mode a transaction is begun if none is open yet.
    pub async fn set_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("set a savepoint")?;
        if self.txn.is_none() {
            if self.state.autocommit {
                return Err(no_transaction());
            }
            self.begin_transaction(self.state.read_only).await?;
        }
        let txn = self.txn.as_mut().ok_or_else(no_transaction)?;
        txn.savepoints.set(name, txn.buffer.len())
    }

    /// Rolls the transaction back to a savepoint: the buffer is truncated to the savepoint
    /// and replayed against a new backend transaction, discarding all later effects.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("roll back to a savepoint")?;
        let txn = self.txn.as_mut().ok_or_else(no_transaction)?;
        let position = txn.savepoints.rollback_to(name)?;
        if position == txn.buffer.len() || txn.handle.read_only {
            return Ok(());
        }
        debug!("Rolling back to savepoint {} at operation {}", name, position);
        txn.buffer.truncate(position);
        let mut cycle = self.retry.replay_cycle();
        let replayed = self
            .retry
            .restart(
                &mut self.backend,
                &mut txn.handle,
                &mut txn.buffer,
                txn.tag.as_deref(),
                &mut cycle,
                Replay::Refresh,
            )
            .await;
        if let Err(err) = replayed {
            self.discard_transaction().await;
            return Err(err);
        }
        Ok(())
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.check_no_batch("release a savepoint")?;
        self.txn.as_mut().ok_or_else(no_transaction)?.savepoints.release(name)
    }

    pub fn start_batch_ddl(&mut self) -> Result<()> {
        self.start_batch(BatchMode::Ddl)
    }

    pub fn start_batch_dml(&mut self) -> Result<()> {
        self.start_batch(BatchMode::Dml)
    }

    fn start_batch(&mut self, mode: BatchMode) -> Result<()> {
        self.ensure_open()?;
        self.state.check_start_batch(mode)?;
        self.batch.start(mode)?;
        self.state.batch_mode = mode;
        Ok(())
    }

    /// Discards the open batch without contacting the backend.
    pub fn abort_batch(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.batch.abort()?;
        self.state.batch_mode = BatchMode::None;
        Ok(())
    }

    /// Submits the open batch, returning one row count per statement. The batch is closed
    /// whatever the outcome.
    pub async fn run_batch(&mut self) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let buffer = self.batch.take()?;
        self.state.batch_mode = BatchMode::None;
        match buffer {
            BatchBuffer::Ddl(statements) => {
                batch::run_ddl(&mut self.backend, statements, self.timeout).await
            }
            BatchBuffer::Dml(statements) if statements.is_empty() => Ok(Vec::new()),
            BatchBuffer::Dml(statements) => self.run_dml_batch(statements).await,
        }
    }

    /// Runs a DML batch in the open transaction, or in an implicit one in autocommit mode.
    /// A partial failure leaves the enclosing transaction usable; an implicit transaction
    /// commits the statements that completed.
    async fn run_dml_batch(&mut self, statements: Vec<Statement>) -> Result<Vec<u64>> {
        let implicit = self.txn.is_none() && self.state.autocommit;
        if self.ensure_transaction().await?.read_only {
            return Err(Error::ReadOnly);
        }
        debug!("Submitting DML batch of {} statements", statements.len());
        match self.run_buffered(Operation::Batch(statements)).await {
            Ok(Output::Batch(outcome)) => {
                if implicit {
                    self.commit_transaction().await?;
                }
                batch::dml_result(outcome)
            }
            Ok(output) => Err(Error::Internal(format!("Unexpected batch output {:?}", output))),
            Err(err) => {
                if implicit {
                    self.discard_transaction().await;
                }
                Err(err)
            }
        }
    }

    /// Closes the connection, rolling back any open transaction and discarding any batch.
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.batch.is_empty() {
            debug!("Discarding batch of {} statements", self.batch.len());
        }
        self.batch.clear();
        self.state.batch_mode = BatchMode::None;
        self.discard_transaction().await;
        self.closed = true;
        debug!("Connection closed");
        Ok(())
    }
}

fn no_transaction() -> Error {
    Error::InvalidState("No transaction is active".into())
}
