// src/client/mod.rs

//! The public entry point: a cloneable handle that multiplexes every caller
//! onto one connection, plus factories for pipelines and subscribers.

mod commands;

pub use commands::{Commands, Executor};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::core::ClientError;
use crate::core::mux::MuxExecutor;
use crate::core::pipeline::Pipeline;
use crate::core::protocol::{Command, Reply};
use crate::core::pubsub::Subscriber;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// A handle to one multiplexed connection. Clones share the connection, and
/// commands from all clones reach the server in the order they were issued.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    mux: MuxExecutor,
}

impl Client {
    /// Connects eagerly: dial, authentication and database selection happen
    /// before this returns, so configuration mistakes surface here.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let config = validated(config)?;
        let connection = Connection::open(config.clone()).await?;
        Ok(Self::with_connection(config, connection))
    }

    /// Creates the client without dialing; the first command connects.
    pub fn lazy(config: ClientConfig) -> Result<Self, ClientError> {
        let config = validated(config)?;
        let connection = Connection::new(config.clone());
        Ok(Self::with_connection(config, connection))
    }

    fn with_connection(config: Arc<ClientConfig>, connection: Connection) -> Self {
        let mux = MuxExecutor::spawn(connection, config.queue_capacity);
        Self { config, mux }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one command through the shared queue. An error reply comes back
    /// as `ClientError::Server`.
    pub async fn send(&self, command: Command) -> Result<Reply, ClientError> {
        self.mux.exec(command).await
    }

    /// A batch sent in one round trip when flushed.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.mux.clone(), false)
    }

    /// Like [`Client::pipeline`], wrapped in `MULTI`/`EXEC`.
    pub fn transaction(&self) -> Pipeline {
        Pipeline::new(self.mux.clone(), true)
    }

    /// A subscriber on a new connection with this client's configuration.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(Connection::new(self.config.clone()))
    }

    /// Opens a subscriber and subscribes it to `channels`.
    pub async fn subscribe(&self, channels: &[&str]) -> Result<Subscriber, ClientError> {
        let mut subscriber = self.subscriber();
        subscriber.subscribe(channels.iter().copied()).await?;
        Ok(subscriber)
    }

    /// Opens a subscriber and subscribes it to `patterns`.
    pub async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscriber, ClientError> {
        let mut subscriber = self.subscriber();
        subscriber.psubscribe(patterns.iter().copied()).await?;
        Ok(subscriber)
    }

    /// Turns this client's own connection into a subscriber once every
    /// command queued before has completed. Other clones of this client get
    /// `WorkerGone` afterwards, and their `close` no longer reaches the
    /// subscriber.
    pub async fn into_subscriber(self) -> Result<Subscriber, ClientError> {
        let connection = self.mux.detach().await?;
        debug!("Client connection handed over to a subscriber.");
        Ok(Subscriber::new(connection))
    }

    /// Closes the shared connection for every clone. Idempotent.
    pub async fn close(&self) {
        self.mux.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }
}

fn validated(config: ClientConfig) -> Result<Arc<ClientConfig>, ClientError> {
    config
        .validate()
        .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
    Ok(Arc::new(config))
}

#[async_trait]
impl Executor for Client {
    async fn exec(&mut self, command: Command) -> Result<Reply, ClientError> {
        self.send(command).await
    }
}

#[async_trait]
impl Executor for Pipeline {
    /// Buffers the command; the placeholder `QUEUED` is returned right away.
    async fn exec(&mut self, command: Command) -> Result<Reply, ClientError> {
        Ok(self.queue(command))
    }
}
