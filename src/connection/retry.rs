use super::buffer::{Observed, Operation, Output, TransactionBuffer};
use crate::error::{Error, Result};
use crate::session::{with_timeout, BackendSession, TxnHandle};

use log::{debug, error, info, warn};
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Bounds on retrying aborted transactions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts per abort cycle.
    pub max_attempts: u32,
    /// Backoff before the first attempt, doubled for every following attempt.
    pub base_delay_ms: u64,
    /// Upper bound of the backoff, before jitter.
    pub max_delay_ms: u64,
    /// Wall-clock ceiling of a whole retry cycle.
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 8, base_delay_ms: 10, max_delay_ms: 1_000, max_elapsed_ms: 60_000 }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(Error::Config("retry.base_delay_ms exceeds retry.max_delay_ms".into()));
        }
        Ok(())
    }

    /// The backoff for a 1-based attempt number, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

/// A single retry attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub backoff: Duration,
    pub started_at: Instant,
}

/// Tracks the attempts of one retry cycle, i.e. the recovery of one failed operation.
#[derive(Debug)]
pub struct RetryCycle {
    attempts: u32,
    started_at: Instant,
    /// Whether the first attempt runs without backoff.
    immediate: bool,
}

impl RetryCycle {
    fn new(immediate: bool) -> Self {
        Self { attempts: 0, started_at: Instant::now(), immediate }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// How a replay treats the recorded observations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Replay {
    /// Abort recovery: every replayed result must match what the caller saw.
    Verify,
    /// Savepoint rollback: nothing to verify against, the recorded observations are
    /// replaced by the replayed ones.
    Refresh,
}

/// Abort retry counters for a connection. Savepoint replays are not counted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Abort signals handed to the retry engine, including aborts during a replay.
    pub aborts: u64,
    /// Retry attempts started.
    pub attempts: u64,
    /// Cycles whose aborted statement or commit went through in the new transaction.
    pub recovered: u64,
    /// Cycles that gave up with AbortedCannotRetry.
    pub failed: u64,
}

/// Recovers aborted read-write transactions by replaying their buffered operations against
/// a new backend transaction, checking that the replay observes exactly what the caller
/// observed the first time around.
#[derive(Debug)]
pub struct RetryEngine {
    policy: RetryPolicy,
    timeout: Option<Duration>,
    stats: RetryStats,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, timeout: Option<Duration>) -> Self {
        Self { policy, timeout, stats: RetryStats::default() }
    }

    pub fn stats(&self) -> &RetryStats {
        &self.stats
    }

    /// Records an abort of an operation and returns its retry cycle, starting one on the
    /// operation's first abort.
    pub fn abort<'a>(&mut self, cycle: &'a mut Option<RetryCycle>) -> &'a mut RetryCycle {
        self.stats.aborts += 1;
        cycle.get_or_insert_with(|| RetryCycle::new(false))
    }

    /// Records that the operation of a retry cycle completed after the replay.
    pub fn recovered(&mut self) {
        self.stats.recovered += 1;
    }

    /// Starts a cycle for a caller-initiated replay, whose first attempt runs immediately.
    pub fn replay_cycle(&self) -> RetryCycle {
        RetryCycle::new(true)
    }

    /// Plans the next attempt of a cycle, or gives up if the cycle is out of budget.
    pub fn next_attempt(&self, cycle: &mut RetryCycle) -> Result<RetryAttempt> {
        if cycle.attempts >= self.policy.max_attempts {
            return Err(Error::AbortedCannotRetry(format!(
                "retries exhausted after {} attempts",
                cycle.attempts
            )));
        }
        cycle.attempts += 1;
        let backoff = match cycle.immediate && cycle.attempts == 1 {
            true => Duration::ZERO,
            false => self.jittered(self.policy.backoff(cycle.attempts)),
        };
        if cycle.started_at.elapsed() + backoff > self.policy.max_elapsed() {
            return Err(Error::AbortedCannotRetry(format!(
                "retry deadline of {:?} exceeded",
                self.policy.max_elapsed()
            )));
        }
        Ok(RetryAttempt { attempt: cycle.attempts, backoff, started_at: Instant::now() })
    }

    /// Adds a random jitter of up to half the delay.
    fn jittered(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        match millis / 2 {
            0 => delay,
            max => delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max)),
        }
    }

    /// Replaces the transaction with a new backend transaction holding the same buffered
    /// operations. Aborts during the replay are retried with backoff until the cycle runs out
    /// of budget; a replay that observes different results fails with AbortedCannotRetry.
    pub async fn restart<B: BackendSession>(
        &mut self,
        backend: &mut B,
        txn: &mut TxnHandle,
        buffer: &mut TransactionBuffer,
        tag: Option<&str>,
        cycle: &mut RetryCycle,
        mode: Replay,
    ) -> Result<()> {
        loop {
            let attempt = match self.next_attempt(cycle) {
                Ok(attempt) => attempt,
                Err(err) => {
                    error!("Giving up on transaction {}: {}", txn.id, err);
                    self.stats.failed += 1;
                    return Err(err);
                }
            };
            if !attempt.backoff.is_zero() {
                debug!("Backing off {:?} before attempt {}", attempt.backoff, attempt.attempt);
                tokio::time::sleep(attempt.backoff).await;
            }
            if mode == Replay::Verify {
                self.stats.attempts += 1;
            }
            if let Err(err) = with_timeout(self.timeout, backend.rollback(*txn)).await {
                debug!("Ignoring rollback failure of transaction {}: {}", txn.id, err);
            }
            *txn = with_timeout(self.timeout, backend.begin(false, tag.map(str::to_owned))).await?;
            match self.replay(backend, *txn, buffer, mode).await {
                Ok(()) => {
                    if mode == Replay::Verify {
                        info!(
                            "Retried transaction as {} after {} attempts, replaying {} operations",
                            txn.id,
                            attempt.attempt,
                            buffer.len()
                        );
                    }
                    return Ok(());
                }
                Err(Error::Abort) => {
                    warn!(
                        "Transaction {} aborted during replay attempt {}",
                        txn.id, attempt.attempt
                    );
                    if mode == Replay::Verify {
                        self.stats.aborts += 1;
                    }
                }
                Err(err) => {
                    if let Error::AbortedCannotRetry(reason) = &err {
                        error!("Giving up on transaction {}: {}", txn.id, reason);
                        self.stats.failed += 1;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Replays the buffered operations in order against the given transaction.
    async fn replay<B: BackendSession>(
        &self,
        backend: &mut B,
        txn: TxnHandle,
        buffer: &mut TransactionBuffer,
        mode: Replay,
    ) -> Result<()> {
        for op in buffer.operations_mut() {
            let result = run(backend, txn, &op.operation, self.timeout).await;
            let observed = match Observed::of(&result)? {
                Some(observed) => observed,
                None => return result.map(|_| ()),
            };
            match mode {
                Replay::Verify if observed != op.observed => {
                    return Err(Error::AbortedCannotRetry(format!(
                        "replayed operation {} observed {:?}, originally {:?}",
                        op.sequence, observed, op.observed
                    )));
                }
                Replay::Verify => {}
                Replay::Refresh => op.observed = observed,
            }
        }
        Ok(())
    }
}

/// Runs a single operation in a transaction.
pub(crate) async fn run<B: BackendSession>(
    backend: &mut B,
    txn: TxnHandle,
    operation: &Operation,
    timeout: Option<Duration>,
) -> Result<Output> {
    match operation {
        Operation::Query(statement) | Operation::Dml(statement) => {
            with_timeout(timeout, backend.execute(txn, statement.clone()))
                .await
                .map(Output::Statement)
        }
        Operation::Batch(statements) => {
            with_timeout(timeout, backend.submit_dml_batch(txn, statements.clone()))
                .await
                .map(Output::Batch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Memory, Statement};
    use crate::types::Value;

    fn policy() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay_ms: 10, max_delay_ms: 25, max_elapsed_ms: 1_000 }
    }

    #[test]
    fn backoff() {
        let p = policy();
        assert_eq!(Duration::from_millis(10), p.backoff(1));
        assert_eq!(Duration::from_millis(20), p.backoff(2));
        assert_eq!(Duration::from_millis(25), p.backoff(3));
        assert_eq!(Duration::from_millis(25), p.backoff(64));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts() -> Result<()> {
        let engine = RetryEngine::new(policy(), None);
        let mut cycle = RetryCycle::new(false);
        for n in 1..=3 {
            let attempt = engine.next_attempt(&mut cycle)?;
            assert_eq!(n, attempt.attempt);
            let base = policy().backoff(n);
            assert!(attempt.backoff >= base && attempt.backoff <= base + base / 2);
        }
        assert!(matches!(engine.next_attempt(&mut cycle), Err(Error::AbortedCannotRetry(_))));

        let mut cycle = engine.replay_cycle();
        assert_eq!(Duration::ZERO, engine.next_attempt(&mut cycle)?.backoff);

        // The deadline covers the whole cycle.
        let mut cycle = RetryCycle::new(false);
        tokio::time::advance(Duration::from_millis(995)).await;
        assert!(matches!(engine.next_attempt(&mut cycle), Err(Error::AbortedCannotRetry(_))));
        Ok(())
    }

    #[test]
    fn validate() {
        assert_eq!(Ok(()), RetryPolicy::default().validate());
        assert!(RetryPolicy { max_attempts: 0, ..policy() }.validate().is_err());
        assert!(RetryPolicy { base_delay_ms: 100, ..policy() }.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart() -> Result<()> {
        let mut db = Memory::new();
        db.submit_ddl_batch(vec!["CREATE TABLE t (id INT, x INT)".into()]).await?;
        let mut engine = RetryEngine::new(policy(), None);

        let mut txn = db.begin(false, None).await?;
        let mut buffer = TransactionBuffer::new();
        let insert =
            Operation::Dml(Statement::new("INSERT INTO t VALUES (?, ?)", vec![1.into(), 7.into()]));
        let select = Operation::Query(Statement::new("SELECT * FROM t", vec![]));
        for op in [insert, select] {
            let result = run(&mut db, txn, &op, None).await;
            let observed = Observed::of(&result)?.expect("observable result");
            buffer.push(op, observed);
        }
        let first = txn;
        db.abort_statements("select", 1)?;

        let mut cycle = None;
        let cycle = engine.abort(&mut cycle);
        engine.restart(&mut db, &mut txn, &mut buffer, None, cycle, Replay::Verify).await?;
        assert_ne!(first, txn);
        assert_eq!(2, cycle.attempts());
        // The abort during the first replay is counted too. Recovery is up to the caller.
        assert_eq!(RetryStats { aborts: 2, attempts: 2, recovered: 0, failed: 0 }, *engine.stats());

        db.commit(txn).await?;
        assert_eq!(vec![(1, Value::Integer(7))], db.rows("t")?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn divergence() -> Result<()> {
        let mut db = Memory::new();
        db.submit_ddl_batch(vec!["CREATE TABLE t (id INT, x INT)".into()]).await?;
        let mut engine = RetryEngine::new(policy(), None);
        let mut txn = db.begin(false, None).await?;
        let mut buffer = TransactionBuffer::new();
        let select = Operation::Query(Statement::new("SELECT * FROM t", vec![]));
        let observed = Observed::of(&run(&mut db, txn, &select, None).await)?.expect("rows");
        buffer.push(select, observed);

        // A concurrent commit changes what the query sees.
        let mut other = db.clone();
        let concurrent = other.begin(false, None).await?;
        other.execute(concurrent, Statement::new("INSERT INTO t VALUES (1, 1)", vec![])).await?;
        other.commit(concurrent).await?;

        let mut cycle = None;
        let cycle = engine.abort(&mut cycle);
        let result =
            engine.restart(&mut db, &mut txn, &mut buffer, None, cycle, Replay::Verify).await;
        assert!(matches!(result, Err(Error::AbortedCannotRetry(_))));
        assert_eq!(1, engine.stats().failed);

        // A refreshing replay accepts the new state instead.
        let mut cycle = engine.replay_cycle();
        engine.restart(&mut db, &mut txn, &mut buffer, None, &mut cycle, Replay::Refresh).await?;
        let checksum = match &buffer.operations()[0].observed {
            Observed::Rows(checksum) => *checksum,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(1, checksum.rows);
        Ok(())
    }
}
