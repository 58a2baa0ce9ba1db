use crate::error::{Error, Result};
use crate::protocol::{Envelope, Request, Response};
use crate::session::{BackendSession, TxnHandle};

use futures::sink::SinkExt as _;
use futures::stream::TryStreamExt as _;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

type Stream = tokio_serde::Framed<
    Framed<TcpStream, LengthDelimitedCodec>,
    Envelope<Request>,
    Envelope<Result<Response>>,
    tokio_serde::formats::Bincode<Envelope<Request>, Envelope<Result<Response>>>,
>;

/// Serves a backend to remote clients, giving each client its own session.
pub struct Server<B: BackendSession + Clone + 'static> {
    backend: B,
}

impl<B: BackendSession + Clone + 'static> Server<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Accepts clients until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        loop {
            let (socket, peer) = listener.accept().await?;
            let session = Session::new(self.backend.clone());
            tokio::spawn(async move {
                info!("Client {} connected", peer);
                match session.serve(socket).await {
                    Ok(()) => info!("Client {} disconnected", peer),
                    Err(err) => error!("Client {} error: {}", peer, err),
                }
            });
        }
    }
}

/// A client session. Transactions the client leaves open are rolled back when it
/// disconnects.
struct Session<B: BackendSession> {
    backend: B,
    open: HashSet<TxnHandle>,
}

impl<B: BackendSession> Session<B> {
    fn new(backend: B) -> Self {
        Self { backend, open: HashSet::new() }
    }

    async fn serve(mut self, socket: TcpStream) -> Result<()> {
        let mut stream: Stream = tokio_serde::Framed::new(
            Framed::new(socket, LengthDelimitedCodec::new()),
            tokio_serde::formats::Bincode::default(),
        );
        let result = async {
            while let Some(Envelope { id, body }) = stream.try_next().await? {
                debug!("Received request {}: {:?}", id, body);
                let response = self.request(body).await;
                stream.send(Envelope { id, body: response }).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        for txn in self.open.drain() {
            if let Err(err) = self.backend.rollback(txn).await {
                warn!("Failed to roll back abandoned transaction {}: {}", txn.id, err);
            }
        }
        result
    }

    async fn request(&mut self, request: Request) -> Result<Response> {
        Ok(match request {
            Request::Begin { read_only, tag } => {
                let txn = self.backend.begin(read_only, tag).await?;
                self.open.insert(txn);
                Response::Begin(txn)
            }
            Request::Execute { txn, statement } => {
                Response::Execute(self.backend.execute(txn, statement).await?)
            }
            Request::Commit(txn) => {
                self.open.remove(&txn);
                self.backend.commit(txn).await?;
                Response::Commit
            }
            Request::Rollback(txn) => {
                self.open.remove(&txn);
                self.backend.rollback(txn).await?;
                Response::Rollback
            }
            Request::DdlBatch(statements) => {
                Response::Batch(self.backend.submit_ddl_batch(statements).await?)
            }
            Request::DmlBatch { txn, statements } => {
                Response::Batch(self.backend.submit_dml_batch(txn, statements).await?)
            }
        })
    }
}
