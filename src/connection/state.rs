use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::types::Value;

use std::fmt::{self, Display};

/// The kind of backend transaction currently open, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    None,
    ReadWrite,
    ReadOnly,
}

/// The kind of batch currently open, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    None,
    Ddl,
    Dml,
}

/// The connection state machine's phase, derived from the connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Autocommit,
    ExplicitTxn,
    DdlBatch,
    DmlBatch,
    Closed,
}

impl Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionMode::None => "NONE",
            TransactionMode::ReadWrite => "READ_WRITE",
            TransactionMode::ReadOnly => "READ_ONLY",
        })
    }
}

impl Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchMode::None => "NONE",
            BatchMode::Ddl => "DDL",
            BatchMode::Dml => "DML",
        })
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::Autocommit => "autocommit",
            Phase::ExplicitTxn => "transaction",
            Phase::DdlBatch => "ddl batch",
            Phase::DmlBatch => "dml batch",
            Phase::Closed => "closed",
        })
    }
}

/// Connection mode flags. Every transition goes through the guards below, which never
/// contact the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionState {
    pub autocommit: bool,
    pub read_only: bool,
    pub transaction_mode: TransactionMode,
    pub batch_mode: BatchMode,
    /// Tag for the next statement only.
    pub statement_tag: Option<String>,
    /// Tag for the next (or current) transaction.
    pub transaction_tag: Option<String>,
    pub retry_enabled: bool,
}

impl ConnectionState {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            autocommit: config.autocommit,
            read_only: config.read_only,
            transaction_mode: TransactionMode::None,
            batch_mode: BatchMode::None,
            statement_tag: None,
            transaction_tag: None,
            retry_enabled: config.retry_aborts_internally,
        }
    }

    pub fn phase(&self) -> Phase {
        match (self.batch_mode, self.transaction_mode) {
            (BatchMode::Ddl, _) => Phase::DdlBatch,
            (BatchMode::Dml, _) => Phase::DmlBatch,
            (BatchMode::None, TransactionMode::ReadWrite | TransactionMode::ReadOnly) => {
                Phase::ExplicitTxn
            }
            (BatchMode::None, TransactionMode::None) if self.autocommit => Phase::Autocommit,
            (BatchMode::None, TransactionMode::None) => Phase::Idle,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_mode != TransactionMode::None
    }

    pub fn in_batch(&self) -> bool {
        self.batch_mode != BatchMode::None
    }

    /// Errors if a batch is open, naming the refused action.
    pub fn check_no_batch(&self, action: &str) -> Result<()> {
        match self.batch_mode {
            BatchMode::None => Ok(()),
            mode => Err(Error::InvalidState(format!(
                "Cannot {} while a {} batch is active",
                action, mode
            ))),
        }
    }

    /// Errors unless a batch of the given kind may be started.
    pub fn check_start_batch(&self, kind: BatchMode) -> Result<()> {
        if self.in_batch() {
            return Err(Error::InvalidState("a DML or DDL batch has already been started".into()));
        }
        match kind {
            BatchMode::Ddl if self.in_transaction() => Err(Error::InvalidState(
                "Cannot start a DDL batch while a transaction is active".into(),
            )),
            BatchMode::Dml
                if self.read_only || self.transaction_mode == TransactionMode::ReadOnly =>
            {
                Err(Error::InvalidState("Cannot start a DML batch in read-only mode".into()))
            }
            BatchMode::None => Err(Error::Internal("No batch kind given".into())),
            _ => Ok(()),
        }
    }

    /// Errors if the transaction tag can't be changed.
    pub fn check_transaction_tag(&self) -> Result<()> {
        match self.in_transaction() {
            true => Err(Error::InvalidState(
                "Cannot set the transaction tag while a transaction is active".into(),
            )),
            false => Ok(()),
        }
    }

    /// Returns the statement tag, which only applies to a single statement.
    pub fn take_statement_tag(&mut self) -> Option<String> {
        self.statement_tag.take()
    }

    /// Looks up a variable by its upper-case name, as used by SHOW VARIABLE.
    pub fn variable(&self, name: &str) -> Option<Value> {
        let tag = |t: &Option<String>| t.clone().map(Value::String).unwrap_or(Value::Null);
        Some(match name {
            "AUTOCOMMIT" => Value::Boolean(self.autocommit),
            "READONLY" => Value::Boolean(self.read_only),
            "RETRY_ABORTS_INTERNALLY" => Value::Boolean(self.retry_enabled),
            "TRANSACTION_TAG" => tag(&self.transaction_tag),
            "STATEMENT_TAG" => tag(&self.statement_tag),
            "BATCH_MODE" => Value::String(self.batch_mode.to_string()),
            "TRANSACTION_MODE" => Value::String(self.transaction_mode.to_string()),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ConnectionState {
        ConnectionState::new(&ConnectionConfig::default())
    }

    #[test]
    fn phases() {
        let mut s = state();
        assert_eq!(Phase::Autocommit, s.phase());
        s.autocommit = false;
        assert_eq!(Phase::Idle, s.phase());
        s.transaction_mode = TransactionMode::ReadOnly;
        assert_eq!(Phase::ExplicitTxn, s.phase());
        s.batch_mode = BatchMode::Dml;
        assert_eq!(Phase::DmlBatch, s.phase());
        s.transaction_mode = TransactionMode::None;
        s.batch_mode = BatchMode::Ddl;
        assert_eq!(Phase::DdlBatch, s.phase());
    }

    #[test]
    fn batch_guards() {
        let mut s = state();
        assert_eq!(Ok(()), s.check_start_batch(BatchMode::Ddl));
        assert_eq!(Ok(()), s.check_start_batch(BatchMode::Dml));

        s.batch_mode = BatchMode::Ddl;
        for kind in [BatchMode::Ddl, BatchMode::Dml] {
            assert_eq!(
                Err(Error::InvalidState("a DML or DDL batch has already been started".into())),
                s.check_start_batch(kind)
            );
        }
        assert!(matches!(s.check_no_batch("commit"), Err(Error::InvalidState(_))));

        s.batch_mode = BatchMode::None;
        s.transaction_mode = TransactionMode::ReadWrite;
        assert!(matches!(s.check_start_batch(BatchMode::Ddl), Err(Error::InvalidState(_))));
        assert_eq!(Ok(()), s.check_start_batch(BatchMode::Dml));
        assert!(matches!(s.check_transaction_tag(), Err(Error::InvalidState(_))));

        s.transaction_mode = TransactionMode::None;
        s.read_only = true;
        assert!(matches!(s.check_start_batch(BatchMode::Dml), Err(Error::InvalidState(_))));
    }

    #[test]
    fn variables() {
        let mut s = state();
        s.statement_tag = Some("q1".into());
        assert_eq!(Some(Value::Boolean(true)), s.variable("AUTOCOMMIT"));
        assert_eq!(Some(Value::String("q1".into())), s.variable("STATEMENT_TAG"));
        assert_eq!(Some(Value::Null), s.variable("TRANSACTION_TAG"));
        assert_eq!(Some(Value::String("NONE".into())), s.variable("BATCH_MODE"));
        assert_eq!(None, s.variable("NOPE"));
        assert_eq!(Some("q1".to_string()), s.take_statement_tag());
        assert_eq!(None, s.statement_tag);
    }
}
