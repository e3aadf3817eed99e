// src/core/pipeline.rs

//! Batches commands locally and sends them as one round trip, optionally
//! wrapped in `MULTI`/`EXEC`.

use crate::core::ClientError;
use crate::core::mux::MuxExecutor;
use crate::core::protocol::{Command, Reply};
use tracing::debug;

/// A buffer of commands flushed through the mux queue as a single unit.
///
/// Commands added with [`Pipeline::queue`] (or through the `Commands` trait)
/// resolve immediately with a `QUEUED` placeholder; their real results come
/// from [`Pipeline::flush`].
pub struct Pipeline {
    executor: MuxExecutor,
    commands: Vec<Command>,
    transaction: bool,
}

impl Pipeline {
    pub(crate) fn new(executor: MuxExecutor, transaction: bool) -> Self {
        Self {
            executor,
            commands: Vec::new(),
            transaction,
        }
    }

    /// Appends a command and returns the `QUEUED` placeholder.
    pub fn queue(&mut self, command: Command) -> Reply {
        self.commands.push(command);
        Reply::Status("QUEUED".to_string())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_transaction(&self) -> bool {
        self.transaction
    }

    /// Drops every buffered command.
    pub fn discard(&mut self) {
        self.commands.clear();
    }

    /// Sends the buffer and returns one result per buffered command, in order.
    ///
    /// The outer `Err` means the batch as a whole failed (transport, closed);
    /// the buffer is then kept so the caller can flush again. On success the
    /// buffer is cleared.
    pub async fn flush(&mut self) -> Result<Vec<Result<Reply, ClientError>>, ClientError> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }

        let count = self.commands.len();
        let mut batch = Vec::with_capacity(count + 2);
        if self.transaction {
            batch.push(Command::new("MULTI"));
        }
        batch.extend(self.commands.iter().cloned());
        if self.transaction {
            batch.push(Command::new("EXEC"));
        }

        debug!(
            "Flushing {} of {count} commands.",
            if self.transaction { "transaction" } else { "pipeline" }
        );
        let replies = self.executor.exec_batch(batch).await?;
        let results = resolve_replies(replies, count, self.transaction)?;
        self.commands.clear();
        Ok(results)
    }
}

/// Maps the raw replies of a flushed batch to one result per user command.
///
/// For a plain pipeline that is one reply per command, with error frames
/// turned into `ClientError::Server`. For a transaction the replies are
/// `MULTI`'s status, one `QUEUED` (or error) per command, then `EXEC`'s reply,
/// whose array carries the actual results.
pub fn resolve_replies(
    replies: Vec<Reply>,
    count: usize,
    transaction: bool,
) -> Result<Vec<Result<Reply, ClientError>>, ClientError> {
    let expected = if transaction { count + 2 } else { count };
    if replies.len() != expected {
        return Err(ClientError::UnexpectedReply(format!(
            "expected {expected} replies for the batch, got {}",
            replies.len()
        )));
    }

    if !transaction {
        return Ok(replies.into_iter().map(Reply::into_result).collect());
    }

    let mut replies = replies.into_iter();
    if let Some(Reply::Error(msg)) = replies.next() {
        // MULTI itself was refused; nothing was queued.
        return Ok((0..count)
            .map(|_| Err(ClientError::Server(msg.clone())))
            .collect());
    }

    let queued: Vec<Reply> = replies.by_ref().take(count).collect();
    let exec = replies.next().unwrap_or(Reply::Array(None));

    match exec {
        Reply::Array(Some(items)) if items.len() == count => {
            Ok(items.into_iter().map(Reply::into_result).collect())
        }
        Reply::Array(Some(items)) => Err(ClientError::UnexpectedReply(format!(
            "EXEC returned {} results for {count} commands",
            items.len()
        ))),
        Reply::Array(None) | Reply::Bulk(None) => Ok((0..count)
            .map(|_| Err(ClientError::TransactionAborted))
            .collect()),
        Reply::Error(exec_error) => Ok(queued
            .into_iter()
            .map(|reply| match reply {
                Reply::Error(msg) => Err(ClientError::Server(msg)),
                _ => Err(ClientError::Server(exec_error.clone())),
            })
            .collect()),
        other => Err(ClientError::UnexpectedReply(format!(
            "unexpected EXEC reply: {other:?}"
        ))),
    }
}
