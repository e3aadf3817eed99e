// src/core/pubsub/message.rs

//! Push frames seen on a subscribed connection.

use crate::core::protocol::Reply;
use bytes::Bytes;

/// A published message delivered to a subscriber.
///
/// `T` is the payload type: `String` for [`Subscriber::receive`] and `Bytes` for
/// [`Subscriber::receive_buffers`].
///
/// [`Subscriber::receive`]: super::Subscriber::receive
/// [`Subscriber::receive_buffers`]: super::Subscriber::receive_buffers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<T = String> {
    /// Received because of a `SUBSCRIBE` to `channel`.
    Channel { channel: String, payload: T },
    /// Received because `channel` matched a `PSUBSCRIBE` pattern.
    Pattern {
        pattern: String,
        channel: String,
        payload: T,
    },
}

impl<T> Message<T> {
    pub fn channel(&self) -> &str {
        match self {
            Message::Channel { channel, .. } | Message::Pattern { channel, .. } => channel,
        }
    }

    /// The matching pattern, for pattern messages.
    pub fn pattern(&self) -> Option<&str> {
        match self {
            Message::Channel { .. } => None,
            Message::Pattern { pattern, .. } => Some(pattern),
        }
    }

    pub fn payload(&self) -> &T {
        match self {
            Message::Channel { payload, .. } | Message::Pattern { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> T {
        match self {
            Message::Channel { payload, .. } | Message::Pattern { payload, .. } => payload,
        }
    }

    fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        match self {
            Message::Channel { channel, payload } => Message::Channel {
                channel,
                payload: f(payload),
            },
            Message::Pattern {
                pattern,
                channel,
                payload,
            } => Message::Pattern {
                pattern,
                channel,
                payload: f(payload),
            },
        }
    }
}

impl Message<Bytes> {
    /// Decodes the payload as UTF-8, replacing invalid sequences.
    pub fn into_text(self) -> Message<String> {
        self.map_payload(|b| String::from_utf8_lossy(&b).into_owned())
    }
}

/// The subscription commands and the kind names the server confirms them with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl SubscriptionKind {
    pub fn command_name(self) -> &'static str {
        match self {
            SubscriptionKind::Subscribe => "SUBSCRIBE",
            SubscriptionKind::Unsubscribe => "UNSUBSCRIBE",
            SubscriptionKind::PSubscribe => "PSUBSCRIBE",
            SubscriptionKind::PUnsubscribe => "PUNSUBSCRIBE",
        }
    }

    fn from_confirmation(kind: &[u8]) -> Option<Self> {
        match kind {
            b"subscribe" => Some(SubscriptionKind::Subscribe),
            b"unsubscribe" => Some(SubscriptionKind::Unsubscribe),
            b"psubscribe" => Some(SubscriptionKind::PSubscribe),
            b"punsubscribe" => Some(SubscriptionKind::PUnsubscribe),
            _ => None,
        }
    }
}

/// What a frame read on a subscribed connection turned out to be.
#[derive(Debug)]
pub(crate) enum Push {
    Message(Message<Bytes>),
    Confirmation {
        kind: SubscriptionKind,
        name: Option<String>,
    },
    /// An error frame from the server.
    Error(String),
    /// Pongs and anything else that carries no message.
    Ignored,
}

/// Sorts one frame into a [`Push`].
pub(crate) fn classify(reply: Reply) -> Push {
    let items = match reply {
        Reply::Error(msg) => return Push::Error(msg),
        Reply::Array(Some(items)) => items,
        _ => return Push::Ignored,
    };

    let mut parts = items.into_iter();
    let Some(kind) = parts.next().and_then(frame_bytes) else {
        return Push::Ignored;
    };
    let rest: Vec<Reply> = parts.collect();

    match (kind.as_ref(), rest.len()) {
        (b"message", 2) => {
            let mut rest = rest.into_iter();
            match (next_text(&mut rest), next_bytes(&mut rest)) {
                (Some(channel), Some(payload)) => Push::Message(Message::Channel { channel, payload }),
                _ => Push::Ignored,
            }
        }
        (b"pmessage", 3) => {
            let mut rest = rest.into_iter();
            match (
                next_text(&mut rest),
                next_text(&mut rest),
                next_bytes(&mut rest),
            ) {
                (Some(pattern), Some(channel), Some(payload)) => Push::Message(Message::Pattern {
                    pattern,
                    channel,
                    payload,
                }),
                _ => Push::Ignored,
            }
        }
        (other, _) => match SubscriptionKind::from_confirmation(other) {
            Some(kind) => Push::Confirmation {
                kind,
                name: rest.into_iter().next().and_then(frame_bytes).map(lossy),
            },
            None => Push::Ignored,
        },
    }
}

fn frame_bytes(reply: Reply) -> Option<Bytes> {
    match reply {
        Reply::Bulk(Some(b)) => Some(b),
        Reply::Status(s) => Some(Bytes::from(s)),
        _ => None,
    }
}

fn lossy(b: Bytes) -> String {
    String::from_utf8_lossy(&b).into_owned()
}

fn next_bytes(parts: &mut impl Iterator<Item = Reply>) -> Option<Bytes> {
    parts.next().and_then(frame_bytes)
}

fn next_text(parts: &mut impl Iterator<Item = Reply>) -> Option<String> {
    next_bytes(parts).map(lossy)
}
