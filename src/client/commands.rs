// src/client/commands.rs

//! A small typed layer over the generic [`Command`] builder.

use crate::core::ClientError;
use crate::core::protocol::{Command, Reply, ToArg};
use async_trait::async_trait;
use std::time::Duration;

/// Anything that can run a [`Command`]: a [`Client`](super::Client) executes
/// it, a [`Pipeline`](crate::core::pipeline::Pipeline) buffers it.
#[async_trait]
pub trait Executor: Send {
    async fn exec(&mut self, command: Command) -> Result<Reply, ClientError>;
}

/// Helpers for common commands, available on every [`Executor`].
///
/// They return the raw [`Reply`]; use its `into_*` helpers to get at the value.
/// Inside a pipeline each call returns `QUEUED` and the real replies come
/// from `flush`.
#[async_trait]
pub trait Commands: Executor {
    async fn ping(&mut self) -> Result<Reply, ClientError> {
        self.exec(Command::new("PING")).await
    }

    async fn echo<M: ToArg + Send>(&mut self, message: M) -> Result<Reply, ClientError> {
        self.exec(Command::new("ECHO").arg(message)).await
    }

    async fn get<K: ToArg + Send>(&mut self, key: K) -> Result<Reply, ClientError> {
        self.exec(Command::new("GET").arg(key)).await
    }

    async fn set<K, V>(&mut self, key: K, value: V) -> Result<Reply, ClientError>
    where
        K: ToArg + Send,
        V: ToArg + Send,
    {
        self.exec(Command::new("SET").arg(key).arg(value)).await
    }

    /// `SET key value PX <millis>`.
    async fn set_ex<K, V>(&mut self, key: K, value: V, ttl: Duration) -> Result<Reply, ClientError>
    where
        K: ToArg + Send,
        V: ToArg + Send,
    {
        let millis = ttl.as_millis().min(u64::MAX as u128) as u64;
        self.exec(Command::new("SET").arg(key).arg(value).arg("PX").arg(millis))
            .await
    }

    async fn del<K: ToArg + Send>(&mut self, key: K) -> Result<Reply, ClientError> {
        self.exec(Command::new("DEL").arg(key)).await
    }

    async fn exists<K: ToArg + Send>(&mut self, key: K) -> Result<Reply, ClientError> {
        self.exec(Command::new("EXISTS").arg(key)).await
    }

    async fn incr<K: ToArg + Send>(&mut self, key: K) -> Result<Reply, ClientError> {
        self.exec(Command::new("INCR").arg(key)).await
    }

    async fn incr_by<K: ToArg + Send>(&mut self, key: K, delta: i64) -> Result<Reply, ClientError> {
        self.exec(Command::new("INCRBY").arg(key).arg(delta)).await
    }

    async fn expire<K: ToArg + Send>(&mut self, key: K, ttl: Duration) -> Result<Reply, ClientError> {
        self.exec(Command::new("EXPIRE").arg(key).arg(ttl.as_secs()))
            .await
    }

    async fn ttl<K: ToArg + Send>(&mut self, key: K) -> Result<Reply, ClientError> {
        self.exec(Command::new("TTL").arg(key)).await
    }

    async fn publish<C, M>(&mut self, channel: C, message: M) -> Result<Reply, ClientError>
    where
        C: ToArg + Send,
        M: ToArg + Send,
    {
        self.exec(Command::new("PUBLISH").arg(channel).arg(message))
            .await
    }

    async fn mget<K: ToArg + Send + Sync>(&mut self, keys: &[K]) -> Result<Reply, ClientError> {
        self.exec(Command::new("MGET").args(keys)).await
    }

    async fn hset<K, F, V>(&mut self, key: K, field: F, value: V) -> Result<Reply, ClientError>
    where
        K: ToArg + Send,
        F: ToArg + Send,
        V: ToArg + Send,
    {
        self.exec(Command::new("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hget<K, F>(&mut self, key: K, field: F) -> Result<Reply, ClientError>
    where
        K: ToArg + Send,
        F: ToArg + Send,
    {
        self.exec(Command::new("HGET").arg(key).arg(field)).await
    }
}

impl<E: Executor> Commands for E {}
