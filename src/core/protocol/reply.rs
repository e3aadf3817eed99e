// src/core/protocol/reply.rs

//! Defines the typed value produced by decoding one server frame.

use crate::core::ClientError;
use bytes::Bytes;
use std::fmt;

/// One decoded RESP reply.
///
/// Nil bulk strings and nil arrays are folded into their variants as `None`, so
/// there are exactly five shapes, one per type-prefix byte on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `:<i64>\r\n`
    Integer(i64),
    /// `+<text>\r\n`
    Status(String),
    /// `$<len>\r\n<bytes>\r\n`, or `$-1\r\n` for nil.
    Bulk(Option<Bytes>),
    /// `*<count>\r\n<elements>`, or `*-1\r\n` for nil.
    Array(Option<Vec<Reply>>),
    /// `-<message>\r\n`
    Error(String),
}

impl Reply {
    /// Shorthand for a non-nil bulk string.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(Some(data.into()))
    }

    /// Shorthand for a non-nil array.
    pub fn array(items: Vec<Reply>) -> Self {
        Reply::Array(Some(items))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }

    /// True for the `+OK` status.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s.eq_ignore_ascii_case("OK"))
    }

    /// Turns a top-level error frame into a `ClientError::Server`.
    ///
    /// Errors nested inside arrays are left alone; they are data, e.g. the
    /// per-command results of `EXEC`.
    pub fn into_result(self) -> Result<Reply, ClientError> {
        match self {
            Reply::Error(msg) => Err(ClientError::Server(msg)),
            other => Ok(other),
        }
    }

    pub fn as_integer(&self) -> Result<i64, ClientError> {
        match self {
            Reply::Integer(i) => Ok(*i),
            Reply::Bulk(Some(b)) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ClientError::UnexpectedReply(format!("{self:?} is not an integer"))),
            other => Err(ClientError::UnexpectedReply(format!(
                "expected integer, got {other:?}"
            ))),
        }
    }

    /// Returns the payload of a bulk or status reply, `None` for nil.
    pub fn into_bytes(self) -> Result<Option<Bytes>, ClientError> {
        match self {
            Reply::Bulk(b) => Ok(b),
            Reply::Status(s) => Ok(Some(Bytes::from(s))),
            Reply::Array(None) => Ok(None),
            other => Err(ClientError::UnexpectedReply(format!(
                "expected bulk string, got {other:?}"
            ))),
        }
    }

    /// Like [`Reply::into_bytes`], decoded as (lossy) UTF-8 text.
    pub fn into_string(self) -> Result<Option<String>, ClientError> {
        Ok(self
            .into_bytes()?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Returns the elements of an array reply, `None` for a nil array.
    pub fn into_array(self) -> Result<Option<Vec<Reply>>, ClientError> {
        match self {
            Reply::Array(items) => Ok(items),
            other => Err(ClientError::UnexpectedReply(format!(
                "expected array, got {other:?}"
            ))),
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            Reply::Integer(i) => write!(f, "(integer) {i}"),
            Reply::Status(s) => write!(f, "{s}"),
            Reply::Error(e) => write!(f, "(error) {e}"),
            Reply::Bulk(None) | Reply::Array(None) => write!(f, "(nil)"),
            Reply::Bulk(Some(b)) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Reply::Array(Some(items)) if items.is_empty() => write!(f, "(empty array)"),
            Reply::Array(Some(items)) => {
                let width = items.len().to_string().len();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                        write!(f, "{:indent$}", "")?;
                    }
                    write!(f, "{:>width$}) ", i + 1)?;
                    item.fmt_indented(f, indent + width + 2)?;
                }
                Ok(())
            }
        }
    }
}

/// Renders replies the way `redis-cli` does.
impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl From<i64> for Reply {
    fn from(i: i64) -> Self {
        Reply::Integer(i)
    }
}

impl From<Bytes> for Reply {
    fn from(b: Bytes) -> Self {
        Reply::Bulk(Some(b))
    }
}

impl From<Vec<Reply>> for Reply {
    fn from(items: Vec<Reply>) -> Self {
        Reply::Array(Some(items))
    }
}
