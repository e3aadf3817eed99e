// src/core/pubsub/mod.rs

//! The subscriber side of publish/subscribe.
//!
//! A [`Subscriber`] owns a dedicated [`Connection`], tracks which channels and
//! patterns it is subscribed to, and turns the pushed frames into a stream of
//! [`Message`]s. If the connection breaks, the stream reconnects and restores
//! every tracked subscription before it reads again.

pub mod message;

pub use message::{Message, SubscriptionKind};

use crate::connection::{CloseFlag, Connection};
use crate::core::ClientError;
use crate::core::protocol::Command;
use bytes::Bytes;
use futures::Stream;
use indexmap::IndexSet;
use message::Push;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// The channels and patterns a subscriber is currently subscribed to, in
/// subscription order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    pub channels: IndexSet<String>,
    pub patterns: IndexSet<String>,
}

impl SubscriptionState {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    /// Applies a confirmed (un)subscription. An unsubscribe without names
    /// clears the whole set.
    fn apply(&mut self, kind: SubscriptionKind, names: &[String]) {
        match kind {
            SubscriptionKind::Subscribe => self.channels.extend(names.iter().cloned()),
            SubscriptionKind::PSubscribe => self.patterns.extend(names.iter().cloned()),
            SubscriptionKind::Unsubscribe if names.is_empty() => self.channels.clear(),
            SubscriptionKind::PUnsubscribe if names.is_empty() => self.patterns.clear(),
            SubscriptionKind::Unsubscribe => {
                for name in names {
                    self.channels.shift_remove(name);
                }
            }
            SubscriptionKind::PUnsubscribe => {
                for name in names {
                    self.patterns.shift_remove(name);
                }
            }
        }
    }
}

/// One step of the receive loop.
enum Event {
    Message(Message<Bytes>),
    /// A server error frame; the stream goes on.
    Error(ClientError),
    /// Recovery failed; the stream ends after yielding it.
    Failed(ClientError),
    End,
}

/// A connection in subscribed mode. See the module docs.
pub struct Subscriber {
    connection: Connection,
    state: SubscriptionState,
    pending: VecDeque<Message<Bytes>>,
}

impl Subscriber {
    /// Wraps a connection. It is dialed on the first subscription if needed.
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            state: SubscriptionState::default(),
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.state.channels.iter().map(String::as_str)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.state.patterns.iter().map(String::as_str)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// A handle that ends the receive stream from another task.
    pub fn close_handle(&self) -> CloseFlag {
        self.connection.close_flag()
    }

    pub async fn subscribe<I, S>(&mut self, channels: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.change(SubscriptionKind::Subscribe, collect_names(channels))
            .await
    }

    pub async fn psubscribe<I, S>(&mut self, patterns: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.change(SubscriptionKind::PSubscribe, collect_names(patterns))
            .await
    }

    /// Unsubscribes from the given channels, or from all of them when empty.
    pub async fn unsubscribe<I, S>(&mut self, channels: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.change(SubscriptionKind::Unsubscribe, collect_names(channels))
            .await
    }

    /// Unsubscribes from the given patterns, or from all of them when empty.
    pub async fn punsubscribe<I, S>(&mut self, patterns: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.change(SubscriptionKind::PUnsubscribe, collect_names(patterns))
            .await
    }

    /// Sends one (un)subscription and records it once confirmed.
    async fn change(
        &mut self,
        kind: SubscriptionKind,
        names: Vec<String>,
    ) -> Result<(), ClientError> {
        let subscribing = matches!(
            kind,
            SubscriptionKind::Subscribe | SubscriptionKind::PSubscribe
        );
        if names.is_empty() && subscribing {
            return Ok(());
        }

        if !self.connection.is_connected() {
            if self.state.is_empty() {
                self.connection.ensure_connected().await?;
            } else {
                self.recover().await?;
            }
        }

        if let Err(e) = self.request(kind, &names).await {
            if e.is_recoverable() {
                self.connection.drop_transport();
            }
            return Err(e);
        }
        self.state.apply(kind, &names);
        Ok(())
    }

    /// Writes the command and waits for one confirmation per name. Messages
    /// that arrive in between are queued for the receive stream.
    async fn request(&mut self, kind: SubscriptionKind, names: &[String]) -> Result<(), ClientError> {
        let expected = match (names.len(), kind) {
            (0, SubscriptionKind::Unsubscribe) => self.state.channels.len().max(1),
            (0, SubscriptionKind::PUnsubscribe) => self.state.patterns.len().max(1),
            (n, _) => n,
        };

        let command = Command::new(kind.command_name()).args(names);
        self.connection.write_commands(std::slice::from_ref(&command)).await?;

        let mut confirmed = 0;
        while confirmed < expected {
            let frame = self.connection.read_reply().await?;
            match message::classify(frame) {
                Push::Confirmation { kind: got, name } if got == kind => {
                    debug!("{} confirmed for {name:?}.", kind.command_name());
                    confirmed += 1;
                }
                Push::Message(m) => self.pending.push_back(m),
                Push::Error(msg) => return Err(ClientError::Server(msg)),
                Push::Confirmation { .. } | Push::Ignored => {}
            }
        }
        Ok(())
    }

    /// Re-establishes the connection and every tracked subscription.
    ///
    /// Runs automatically inside the receive stream after a transport or
    /// protocol failure; exposed for callers driving the connection by hand.
    /// A transport failure while resubscribing drops the fresh socket and
    /// starts over, up to `max_retry_count` times. A failure of `reconnect`
    /// itself is returned, since it has already spent its own retries.
    pub async fn recover(&mut self) -> Result<(), ClientError> {
        let max_retries = self.connection.config().max_retry_count;
        let mut attempt = 0;
        loop {
            self.connection.reconnect().await?;
            match self.resubscribe().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() && attempt < max_retries => {
                    let delay = self.connection.config().backoff.delay(attempt);
                    warn!(
                        "Resubscribing failed: {e}. Retrying in {delay:?} ({}/{max_retries})",
                        attempt + 1
                    );
                    self.connection.drop_transport();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_recoverable() {
                        self.connection.drop_transport();
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn resubscribe(&mut self) -> Result<(), ClientError> {
        let channels: Vec<String> = self.state.channels.iter().cloned().collect();
        let patterns: Vec<String> = self.state.patterns.iter().cloned().collect();
        if !channels.is_empty() {
            self.request(SubscriptionKind::Subscribe, &channels).await?;
        }
        if !patterns.is_empty() {
            self.request(SubscriptionKind::PSubscribe, &patterns).await?;
        }
        info!(
            "Subscriptions restored: {} channels, {} patterns.",
            channels.len(),
            patterns.len()
        );
        Ok(())
    }

    async fn next_event(&mut self) -> Event {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Event::Message(message);
            }
            if self.connection.is_closed_by_user() {
                return Event::End;
            }

            if !self.connection.is_connected()
                && let Err(e) = self.recover().await
            {
                return match e {
                    ClientError::Closed => Event::End,
                    e => Event::Failed(e),
                };
            }

            match self.connection.read_frame(None).await {
                Ok(frame) => match message::classify(frame) {
                    Push::Message(m) => return Event::Message(m),
                    Push::Error(msg) => return Event::Error(ClientError::Server(msg)),
                    Push::Confirmation { .. } | Push::Ignored => {}
                },
                Err(ClientError::Closed) => return Event::End,
                Err(e) if e.is_recoverable() => {
                    warn!("Subscriber connection lost: {e}. Recovering...");
                    self.connection.drop_transport();
                }
                Err(e) => return Event::Failed(e),
            }
        }
    }

    /// Waits for the next message with a `Bytes` payload. `None` once the
    /// subscriber is closed.
    pub async fn next_message(&mut self) -> Option<Result<Message<Bytes>, ClientError>> {
        match self.next_event().await {
            Event::Message(m) => Some(Ok(m)),
            Event::Error(e) | Event::Failed(e) => Some(Err(e)),
            Event::End => None,
        }
    }

    /// A stream of messages with text payloads.
    pub fn receive(&mut self) -> impl Stream<Item = Result<Message, ClientError>> + '_ {
        async_stream::stream! {
            loop {
                match self.next_event().await {
                    Event::Message(m) => yield Ok(m.into_text()),
                    Event::Error(e) => yield Err(e),
                    Event::Failed(e) => {
                        yield Err(e);
                        break;
                    }
                    Event::End => break,
                }
            }
        }
    }

    /// A stream of messages with raw `Bytes` payloads.
    pub fn receive_buffers(
        &mut self,
    ) -> impl Stream<Item = Result<Message<Bytes>, ClientError>> + '_ {
        async_stream::stream! {
            loop {
                match self.next_event().await {
                    Event::Message(m) => yield Ok(m),
                    Event::Error(e) => yield Err(e),
                    Event::Failed(e) => {
                        yield Err(e);
                        break;
                    }
                    Event::End => break,
                }
            }
        }
    }

    /// Closes the connection and ends any receive stream.
    pub async fn close(&mut self) {
        self.connection.close().await;
        self.pending.clear();
    }
}

fn collect_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}
