// src/connection/mod.rs

//! A single client connection to the server.
//!
//! The [`Connection`] owns the socket and everything needed to rebuild it: it
//! dials (optionally over TLS), authenticates, selects the database, and on a
//! transport failure transparently reconnects and retries the command that hit
//! it, sleeping according to the configured [`BackoffPolicy`] between attempts.

pub mod backoff;
pub mod stream;

use crate::config::ClientConfig;
use crate::core::ClientError;
use crate::core::protocol::{Command, Reply, ReplyCodec};
use backoff::BackoffPolicy;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stream::ClientStream;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// The lifecycle states of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket. Initial state, and the state after a transport failure.
    Disconnected,
    /// A dial or handshake is in progress.
    Connecting,
    /// The socket is open and the handshake succeeded.
    Connected,
    /// Closed by the user. Terminal.
    Closed,
}

/// A shared "closed by the user" flag.
///
/// It is set from whichever task calls `close`, while the task owning the
/// connection may be blocked in a read; setting it wakes that read up.
#[derive(Debug, Clone, Default)]
pub struct CloseFlag {
    inner: Arc<CloseFlagInner>,
}

#[derive(Debug, Default)]
struct CloseFlagInner {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseFlag {
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

type FramedStream = Framed<ClientStream, ReplyCodec>;

/// One logical connection to the server. See the module docs.
pub struct Connection {
    config: Arc<ClientConfig>,
    framed: Option<FramedStream>,
    state: ConnectionState,
    close_flag: CloseFlag,
}

impl Connection {
    /// Creates a connection without dialing. The first command connects.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            framed: None,
            state: ConnectionState::Disconnected,
            close_flag: CloseFlag::default(),
        }
    }

    /// Creates a connection and dials it right away.
    pub async fn open(config: Arc<ClientConfig>) -> Result<Self, ClientError> {
        let mut connection = Self::new(config);
        connection.connect().await?;
        Ok(connection)
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.framed.is_some()
    }

    pub fn is_closed_by_user(&self) -> bool {
        self.close_flag.is_closed()
    }

    /// A handle that closes this connection from another task.
    pub fn close_flag(&self) -> CloseFlag {
        self.close_flag.clone()
    }

    /// Detaches the connection from every handle of its current close flag.
    /// Used when ownership moves, so the previous owners can no longer close it.
    pub fn reset_close_flag(&mut self) {
        if !self.close_flag.is_closed() {
            self.close_flag = CloseFlag::default();
        }
    }

    fn backoff(&self) -> &BackoffPolicy {
        &self.config.backoff
    }

    /// Dials and performs the handshake, retrying transport failures up to
    /// `max_retry_count` times. Authentication failures are returned at once.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let max_retries = self.config.max_retry_count;
        let mut attempt = 0;
        loop {
            if self.is_closed_by_user() {
                return Err(ClientError::Closed);
            }
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() && attempt < max_retries => {
                    let delay = self.backoff().delay(attempt);
                    warn!(
                        "Failed to connect to {}: {e}. Retrying in {delay:?} ({}/{max_retries})",
                        self.config.addr(),
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One dial plus handshake, without retries.
    async fn connect_once(&mut self) -> Result<(), ClientError> {
        self.framed = None;
        self.state = ConnectionState::Connecting;
        let addr = self.config.addr();
        debug!("Attempting to connect to {addr}");

        let stream = match ClientStream::connect(&self.config).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        self.framed = Some(Framed::new(stream, ReplyCodec));
        self.state = ConnectionState::Connected;

        if let Err(e) = self.handshake().await {
            self.drop_transport();
            return Err(e);
        }
        info!("Connected to {addr}");
        Ok(())
    }

    /// Authenticates, selects the database and names the connection, each as
    /// an ordinary command on the fresh socket.
    async fn handshake(&mut self) -> Result<(), ClientError> {
        if let Some(password) = self.config.password.clone() {
            let auth = match &self.config.username {
                Some(user) => Command::new("AUTH").arg(user).arg(password),
                None => Command::new("AUTH").arg(password),
            };
            match self.round_trip(&auth).await? {
                Reply::Error(msg) => return Err(ClientError::Auth(msg)),
                _ => debug!("Handshake: AUTH successful."),
            }
        }

        if let Some(db) = self.config.database {
            self.round_trip(&Command::new("SELECT").arg(db))
                .await?
                .into_result()?;
            debug!("Handshake: SELECT {db} successful.");
        }

        if let Some(name) = self.config.client_name.clone() {
            self.round_trip(&Command::new("CLIENT").arg("SETNAME").arg(name))
                .await?
                .into_result()?;
            debug!("Handshake: CLIENT SETNAME successful.");
        }
        Ok(())
    }

    /// Sends one command and returns its reply.
    ///
    /// A transport failure drops the socket; unless the connection was closed
    /// by the user, it is rebuilt and the command re-sent, up to
    /// `max_retry_count` times. When every retry fails the first error is
    /// returned. Error replies are returned as `ClientError::Server` and never
    /// retried.
    pub async fn send_command(&mut self, command: &Command) -> Result<Reply, ClientError> {
        self.ensure_connected().await?;

        let original = match self.round_trip(command).await {
            Ok(reply) => return reply.into_result(),
            Err(e) => e,
        };
        self.drop_on_failure(&original);
        if !original.is_transport() || self.is_closed_by_user() {
            return Err(original);
        }

        warn!(
            "Transport error while sending {}: {original}. Reconnecting...",
            command.name_upper()
        );
        for attempt in 0..self.config.max_retry_count {
            tokio::time::sleep(self.backoff().delay(attempt)).await;
            if self.is_closed_by_user() {
                break;
            }

            if let Err(e) = self.connect_once().await {
                if e.is_transport() {
                    debug!("Reconnect attempt {} failed: {e}", attempt + 1);
                    continue;
                }
                return Err(e);
            }

            match self.round_trip(command).await {
                Ok(reply) => return reply.into_result(),
                Err(e) if e.is_transport() => {
                    debug!("Retry {} of {} failed: {e}", attempt + 1, command.name_upper());
                    self.drop_transport();
                }
                Err(e) => {
                    self.drop_on_failure(&e);
                    return Err(e);
                }
            }
        }
        Err(original)
    }

    /// Writes all commands in one go, then reads one reply per command.
    ///
    /// Replies are returned raw, error frames included, in command order. A
    /// transport failure is retried like in [`Connection::send_command`] only
    /// while no reply of the batch has been read, since a partially read batch
    /// may already have been applied by the server.
    pub async fn send_batch(&mut self, commands: &[Command]) -> Result<Vec<Reply>, ClientError> {
        self.ensure_connected().await?;

        let (original, replies_read) = match self.batch_round_trip(commands).await {
            Ok(replies) => return Ok(replies),
            Err(failure) => failure,
        };
        self.drop_on_failure(&original);
        if !original.is_transport() || replies_read > 0 || self.is_closed_by_user() {
            return Err(original);
        }

        warn!(
            "Transport error while sending a batch of {} commands: {original}. Reconnecting...",
            commands.len()
        );
        for attempt in 0..self.config.max_retry_count {
            tokio::time::sleep(self.backoff().delay(attempt)).await;
            if self.is_closed_by_user() {
                break;
            }
            if let Err(e) = self.connect_once().await {
                if e.is_transport() {
                    continue;
                }
                return Err(e);
            }
            match self.batch_round_trip(commands).await {
                Ok(replies) => return Ok(replies),
                Err((e, 0)) if e.is_transport() => self.drop_transport(),
                Err((e, _)) => {
                    self.drop_on_failure(&e);
                    return Err(e);
                }
            }
        }
        Err(original)
    }

    /// Connects if there is no socket yet.
    pub async fn ensure_connected(&mut self) -> Result<(), ClientError> {
        if self.is_closed_by_user() {
            return Err(ClientError::Closed);
        }
        if !self.is_connected() {
            self.connect().await?;
        }
        Ok(())
    }

    async fn round_trip(&mut self, command: &Command) -> Result<Reply, ClientError> {
        debug!("Sending command: {command:?}");
        self.write_commands(std::slice::from_ref(command)).await?;
        self.read_reply().await
    }

    async fn batch_round_trip(
        &mut self,
        commands: &[Command],
    ) -> Result<Vec<Reply>, (ClientError, usize)> {
        debug!("Sending batch of {} commands", commands.len());
        self.write_commands(commands).await.map_err(|e| (e, 0))?;
        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            match self.read_reply().await {
                Ok(reply) => replies.push(reply),
                Err(e) => return Err((e, replies.len())),
            }
        }
        Ok(replies)
    }

    /// Encodes the commands into the write buffer and flushes them as one write.
    pub async fn write_commands(&mut self, commands: &[Command]) -> Result<(), ClientError> {
        let framed = self.framed.as_mut().ok_or(ClientError::ConnectionClosed)?;
        for command in commands {
            framed.feed(command).await?;
        }
        SinkExt::<&Command>::flush(framed).await
    }

    /// Reads exactly one reply frame, honoring `read_timeout` and the close flag.
    /// Error frames are returned as `Reply::Error`, not as `Err`.
    pub async fn read_reply(&mut self) -> Result<Reply, ClientError> {
        let read_timeout = self.config.read_timeout;
        self.read_frame(read_timeout).await
    }

    /// Reads one frame with an explicit timeout. A subscriber waits for pushes
    /// with `None`, since an idle channel is not a failure.
    pub async fn read_frame(&mut self, read_timeout: Option<Duration>) -> Result<Reply, ClientError> {
        let close_flag = self.close_flag.clone();
        let framed = self.framed.as_mut().ok_or(ClientError::ConnectionClosed)?;

        let read = async {
            let next = match read_timeout {
                Some(limit) => tokio::time::timeout(limit, framed.next()).await?,
                None => framed.next().await,
            };
            next.unwrap_or(Err(ClientError::ConnectionClosed))
        };

        tokio::select! {
            biased;
            _ = close_flag.wait() => Err(ClientError::Closed),
            reply = read => reply,
        }
    }

    /// Sends `PING` on the current socket, without retries.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.round_trip(&Command::new("PING")).await? {
            Reply::Status(s) if s.eq_ignore_ascii_case("PONG") => Ok(()),
            Reply::Error(msg) => Err(ClientError::Server(msg)),
            other => Err(ClientError::UnexpectedReply(format!(
                "Unexpected PING reply: {other:?}"
            ))),
        }
    }

    /// Replaces the socket with a fresh one and checks it with `PING`. If the
    /// quick attempt fails, falls back to a full `connect` with retries.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        if self.is_closed_by_user() {
            return Err(ClientError::Closed);
        }
        info!("Reconnecting to {}", self.config.addr());
        self.drop_transport();

        let quick = match self.connect_once().await {
            Ok(()) => self.ping().await,
            Err(e) => Err(e),
        };
        match quick {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_recoverable() => {
                self.drop_on_failure(&e);
                return Err(e);
            }
            Err(e) => {
                debug!("Quick reconnect failed: {e}. Falling back to full connect.");
                self.drop_transport();
            }
        }

        self.connect().await?;
        if let Err(e) = self.ping().await {
            self.drop_on_failure(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Closes the connection on behalf of the user. Calling it again, or on a
    /// socket that already broke, is harmless.
    pub async fn close(&mut self) {
        self.close_flag.close();
        self.state = ConnectionState::Closed;
        if let Some(framed) = self.framed.take() {
            let mut stream = framed.into_inner();
            // The peer may already be gone.
            let _ = stream.shutdown().await;
            debug!("Connection to {} closed.", self.config.addr());
        }
    }

    /// Drops the socket after a transport failure. Unlike [`Connection::close`]
    /// this leaves the connection usable: the next command reconnects.
    pub fn drop_transport(&mut self) {
        self.framed = None;
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Drops the socket if the error left it unusable.
    fn drop_on_failure(&mut self, error: &ClientError) {
        if error.is_recoverable() || matches!(error, ClientError::Closed) {
            self.drop_transport();
        }
    }
}
