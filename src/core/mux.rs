// src/core/mux.rs

//! Serializes requests from many concurrent callers onto one [`Connection`].
//!
//! Callers push `{request, oneshot}` pairs into a bounded queue; a single worker
//! task owns the connection and dispatches them strictly in arrival order, so
//! only one request is ever on the wire and replies can never be mismatched.

use crate::connection::{CloseFlag, Connection};
use crate::core::ClientError;
use crate::core::protocol::{Command, Reply};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// A unit of work for the mux worker.
pub enum Request {
    /// A single command; the reply has its error frame already converted.
    Exec {
        command: Command,
        reply_tx: oneshot::Sender<Result<Reply, ClientError>>,
    },
    /// Commands written back to back; one raw reply per command.
    Batch {
        commands: Vec<Command>,
        reply_tx: oneshot::Sender<Result<Vec<Reply>, ClientError>>,
    },
    /// Releases the socket. Later requests fail with `Closed`.
    Close { done_tx: oneshot::Sender<()> },
    /// Stops the worker and hands the connection back.
    Detach { conn_tx: oneshot::Sender<Connection> },
}

/// The caller-side handle of the queue. Cloning it shares the same worker.
#[derive(Clone)]
pub struct MuxExecutor {
    tx: mpsc::Sender<Request>,
    close_flag: CloseFlag,
}

impl MuxExecutor {
    /// Spawns the worker task that owns `connection`.
    pub fn spawn(connection: Connection, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let close_flag = connection.close_flag();
        tokio::spawn(run_worker(connection, rx));
        Self { tx, close_flag }
    }

    /// Sends one command and waits for its turn and its reply.
    pub async fn exec(&self, command: Command) -> Result<Reply, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Request::Exec { command, reply_tx }).await?;
        reply_rx.await.map_err(|_| ClientError::WorkerGone)?
    }

    /// Sends a batch as one queue unit: no other caller's command can be
    /// interleaved with it.
    pub async fn exec_batch(&self, commands: Vec<Command>) -> Result<Vec<Reply>, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(Request::Batch { commands, reply_tx }).await?;
        reply_rx.await.map_err(|_| ClientError::WorkerGone)?
    }

    /// Closes the connection. Requests already queued fail with `Closed`
    /// when they reach the worker.
    pub async fn close(&self) {
        self.close_flag.close();
        let (done_tx, done_rx) = oneshot::channel();
        if self.enqueue(Request::Close { done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_flag.is_closed()
    }

    /// Takes the connection away from the worker once everything queued
    /// before this call has completed. The worker then stops, and any
    /// remaining handle gets `WorkerGone`.
    pub async fn detach(&self) -> Result<Connection, ClientError> {
        let (conn_tx, conn_rx) = oneshot::channel();
        self.enqueue(Request::Detach { conn_tx }).await?;
        conn_rx.await.map_err(|_| ClientError::WorkerGone)
    }

    async fn enqueue(&self, request: Request) -> Result<(), ClientError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ClientError::WorkerGone)
    }
}

async fn run_worker(mut connection: Connection, mut rx: mpsc::Receiver<Request>) {
    debug!("Mux worker for {} started.", connection.config().addr());
    while let Some(request) = rx.recv().await {
        match request {
            Request::Exec { command, reply_tx } => {
                let result = connection.send_command(&command).await;
                // The caller may have given up waiting.
                let _ = reply_tx.send(result);
            }
            Request::Batch { commands, reply_tx } => {
                let result = connection.send_batch(&commands).await;
                let _ = reply_tx.send(result);
            }
            Request::Close { done_tx } => {
                connection.close().await;
                let _ = done_tx.send(());
            }
            Request::Detach { conn_tx } => {
                info!("Connection detached from mux worker.");
                connection.reset_close_flag();
                if let Err(mut connection) = conn_tx.send(connection) {
                    // Nobody took it; release the socket.
                    connection.close().await;
                }
                return;
            }
        }
    }
    connection.close().await;
    debug!("Mux worker stopped: all handles dropped.");
}
