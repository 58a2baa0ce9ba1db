use crate::session::{BatchOutcome, Outcome, Statement, TxnHandle};

use serde_derive::{Deserialize, Serialize};

/// A client request, one per backend session call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Begin { read_only: bool, tag: Option<String> },
    Execute { txn: TxnHandle, statement: Statement },
    Commit(TxnHandle),
    Rollback(TxnHandle),
    DdlBatch(Vec<String>),
    DmlBatch { txn: TxnHandle, statements: Vec<Statement> },
}

/// A server response. Errors are sent as `Err(Error)` instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Begin(TxnHandle),
    Execute(Outcome),
    Commit,
    Rollback,
    Batch(BatchOutcome),
}

/// A request or response tagged with the request id. Responses carry the id of the
/// request they answer, so a client can skip replies to calls it stopped waiting for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}
