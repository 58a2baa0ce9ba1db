use crate::error::{Error, Result};
use crate::protocol::{Envelope, Request, Response};
use crate::session::{BackendSession, BatchOutcome, Outcome, Statement, TxnHandle};

use futures::sink::SinkExt as _;
use futures::stream::TryStreamExt as _;
use log::debug;
use std::cmp::Ordering;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type Connection = tokio_serde::Framed<
    Framed<TcpStream, LengthDelimitedCodec>,
    Envelope<Result<Response>>,
    Envelope<Request>,
    tokio_serde::formats::Bincode<Envelope<Result<Response>>, Envelope<Request>>,
>;

/// A backend session with a remote sqlconnd server. Errors, including aborts, are passed
/// through from the server as is.
///
/// A call dropped while waiting, e.g. by a statement timeout, leaves its response in the
/// stream. Requests are numbered and the next call skips responses to older requests.
pub struct Client {
    conn: Connection,
    next_id: u64,
}

impl Client {
    /// Connects to a server.
    pub async fn new(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        Ok(Self {
            conn: tokio_serde::Framed::new(
                Framed::new(socket, LengthDelimitedCodec::new()),
                tokio_serde::formats::Bincode::default(),
            ),
            next_id: 0,
        })
    }

    /// Sends a request and waits for its response.
    async fn call(&mut self, request: Request) -> Result<Response> {
        self.next_id += 1;
        let id = self.next_id;
        self.conn.send(Envelope { id, body: request }).await?;
        while let Some(response) = self.conn.try_next().await? {
            match response.id.cmp(&id) {
                Ordering::Less => debug!("Skipping stale response to request {}", response.id),
                Ordering::Equal => return response.body,
                Ordering::Greater => {
                    return Err(Error::Internal(format!(
                        "Response to unknown request {}",
                        response.id
                    )))
                }
            }
        }
        Err(Error::Internal("Server disconnected".into()))
    }
}

fn unexpected(response: Response) -> Error {
    Error::Internal(format!("Unexpected response {:?}", response))
}

impl BackendSession for Client {
    async fn begin(&mut self, read_only: bool, tag: Option<String>) -> Result<TxnHandle> {
        match self.call(Request::Begin { read_only, tag }).await? {
            Response::Begin(txn) => Ok(txn),
            response => Err(unexpected(response)),
        }
    }

    async fn execute(&mut self, txn: TxnHandle, statement: Statement) -> Result<Outcome> {
        match self.call(Request::Execute { txn, statement }).await? {
            Response::Execute(outcome) => Ok(outcome),
            response => Err(unexpected(response)),
        }
    }

    async fn commit(&mut self, txn: TxnHandle) -> Result<()> {
        match self.call(Request::Commit(txn)).await? {
            Response::Commit => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    async fn rollback(&mut self, txn: TxnHandle) -> Result<()> {
        match self.call(Request::Rollback(txn)).await? {
            Response::Rollback => Ok(()),
            response => Err(unexpected(response)),
        }
    }

    async fn submit_ddl_batch(&mut self, statements: Vec<String>) -> Result<BatchOutcome> {
        match self.call(Request::DdlBatch(statements)).await? {
            Response::Batch(outcome) => Ok(outcome),
            response => Err(unexpected(response)),
        }
    }

    async fn submit_dml_batch(
        &mut self,
        txn: TxnHandle,
        statements: Vec<Statement>,
    ) -> Result<BatchOutcome> {
        match self.call(Request::DmlBatch { txn, statements }).await? {
            Response::Batch(outcome) => Ok(outcome),
            response => Err(unexpected(response)),
        }
    }
}
