// src/core/protocol/codec.rs

//! Implements the RESP framing for the client: decoding server replies into
//! [`Reply`] values and encoding [`Command`]s as arrays of bulk strings.

use super::{Command, Reply};
use crate::core::ClientError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits, mirroring what the server accepts.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024; // Max elements in an array.
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024; // 512MB max bulk string size.
const MAX_RECURSION_DEPTH: usize = 256;

/// Outcome of a failed parse attempt on the buffered bytes.
enum ParseError {
    /// The frame is not complete yet; wait for more bytes.
    Incomplete,
    /// The bytes can never form a valid frame.
    Invalid(String),
}

type ParseResult<T> = Result<T, ParseError>;

fn invalid<T>(msg: impl Into<String>) -> ParseResult<T> {
    Err(ParseError::Invalid(msg.into()))
}

/// A `tokio_util::codec` implementation for the client side of RESP.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = ClientError;

    /// Decodes one complete reply, leaving the buffer untouched when the frame
    /// is still incomplete.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_reply(&mut bytes, 0) {
            Ok(reply) => {
                let consumed = src.len() - bytes.len();
                src.advance(consumed);
                Ok(Some(reply))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(msg)) => Err(ClientError::Protocol(msg)),
        }
    }

    /// The peer closed the stream. Leftover bytes mean a frame was cut in half.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(reply) => Ok(Some(reply)),
            None if src.is_empty() => Ok(None),
            None => Err(ClientError::UnexpectedEof),
        }
    }
}

impl Encoder<&Command> for ReplyCodec {
    type Error = ClientError;

    /// Encodes a command as `*<n>` followed by one bulk string per part.
    fn encode(&mut self, item: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut num = itoa::Buffer::new();
        dst.extend_from_slice(b"*");
        dst.extend_from_slice(num.format(item.wire_len()).as_bytes());
        dst.extend_from_slice(CRLF);
        for part in item.parts() {
            put_bulk(dst, part);
        }
        Ok(())
    }
}

impl Encoder<Command> for ReplyCodec {
    type Error = ClientError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Command>>::encode(self, &item, dst)
    }
}

impl Encoder<Reply> for ReplyCodec {
    type Error = ClientError;

    /// Encodes a reply the way a server would send it.
    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut num = itoa::Buffer::new();
        match item {
            Reply::Status(s) => put_line(dst, b'+', s.as_bytes())?,
            Reply::Error(s) => put_line(dst, b'-', s.as_bytes())?,
            Reply::Integer(i) => put_line(dst, b':', num.format(i).as_bytes())?,
            Reply::Bulk(Some(b)) => put_bulk(dst, &b),
            Reply::Bulk(None) => dst.extend_from_slice(b"$-1\r\n"),
            Reply::Array(None) => dst.extend_from_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                put_line(dst, b'*', num.format(items.len()).as_bytes())?;
                for item in items {
                    <Self as Encoder<Reply>>::encode(self, item, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Command {
    /// Encodes the command into a standalone byte buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        // Encoding a command cannot fail.
        let _ = <ReplyCodec as Encoder<&Command>>::encode(&mut ReplyCodec, self, &mut buf);
        buf.freeze()
    }
}

impl Reply {
    /// Encodes the reply into a standalone byte buffer.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, ClientError> {
        let mut buf = BytesMut::new();
        <ReplyCodec as Encoder<Reply>>::encode(&mut ReplyCodec, self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    let mut num = itoa::Buffer::new();
    dst.reserve(data.len() + 16);
    dst.extend_from_slice(b"$");
    dst.extend_from_slice(num.format(data.len()).as_bytes());
    dst.extend_from_slice(CRLF);
    dst.extend_from_slice(data);
    dst.extend_from_slice(CRLF);
}

/// Writes a single-line frame. Line frames cannot carry CR or LF.
fn put_line(dst: &mut BytesMut, prefix: u8, line: &[u8]) -> Result<(), ClientError> {
    if line.iter().any(|&b| b == b'\r' || b == b'\n') {
        return Err(ClientError::Protocol(
            "line frames must not contain CR or LF".into(),
        ));
    }
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(line);
    dst.extend_from_slice(CRLF);
    Ok(())
}

/// Decodes one reply from the front of `bytes`, advancing the slice past it.
fn decode_reply(bytes: &mut &[u8], depth: usize) -> ParseResult<Reply> {
    if depth > MAX_RECURSION_DEPTH {
        return invalid("RESP recursion depth limit exceeded");
    }

    let Some(&prefix) = bytes.first() else {
        return Err(ParseError::Incomplete);
    };

    match prefix {
        b':' => parse_integer(bytes),
        b'+' => parse_status(bytes),
        b'-' => parse_error(bytes),
        b'$' => parse_bulk(bytes),
        b'*' => parse_array(bytes, depth),
        other => invalid(format!("unknown reply type byte 0x{other:02x}")),
    }
}

/// Consumes the prefix byte and returns the rest of the line, without CRLF.
fn parse_line<'a>(bytes: &mut &'a [u8]) -> ParseResult<&'a [u8]> {
    let body = &bytes[1..];
    let Some(pos) = find_crlf(body) else {
        return Err(ParseError::Incomplete);
    };
    let line = &body[..pos];
    *bytes = &body[pos + CRLF_LEN..];
    Ok(line)
}

fn parse_number(line: &[u8]) -> ParseResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map_or_else(
            || invalid(format!("invalid number {:?}", String::from_utf8_lossy(line))),
            Ok,
        )
}

/// Parses an Integer (e.g., `:1000\r\n`).
fn parse_integer(bytes: &mut &[u8]) -> ParseResult<Reply> {
    let line = parse_line(bytes)?;
    Ok(Reply::Integer(parse_number(line)?))
}

/// Parses a Simple String (e.g., `+OK\r\n`).
fn parse_status(bytes: &mut &[u8]) -> ParseResult<Reply> {
    let line = parse_line(bytes)?;
    Ok(Reply::Status(String::from_utf8_lossy(line).into_owned()))
}

/// Parses an Error (e.g., `-ERR message\r\n`).
fn parse_error(bytes: &mut &[u8]) -> ParseResult<Reply> {
    let line = parse_line(bytes)?;
    Ok(Reply::Error(String::from_utf8_lossy(line).into_owned()))
}

/// Parses a Bulk String (e.g., `$5\r\nhello\r\n`). The payload is taken by
/// length, so it may contain any bytes, CRLF included.
fn parse_bulk(bytes: &mut &[u8]) -> ParseResult<Reply> {
    let line = parse_line(bytes)?;
    let declared = parse_number(line)?;

    if declared == -1 {
        return Ok(Reply::Bulk(None));
    }
    if declared < 0 {
        return invalid(format!("negative bulk string length {declared}"));
    }

    let Ok(len) = usize::try_from(declared) else {
        return invalid(format!("bulk string length {declared} exceeds limit"));
    };
    if len > MAX_BULK_STRING_SIZE {
        return invalid(format!("bulk string length {len} exceeds limit"));
    }
    if bytes.len() < len + CRLF_LEN {
        return Err(ParseError::Incomplete);
    }
    if &bytes[len..len + CRLF_LEN] != CRLF {
        return invalid("bulk string is not terminated by CRLF");
    }

    let data = Bytes::copy_from_slice(&bytes[..len]);
    *bytes = &bytes[len + CRLF_LEN..];
    Ok(Reply::Bulk(Some(data)))
}

/// Parses an Array (e.g., `*2\r\n$3\r\nfoo\r\n:1\r\n`).
fn parse_array(bytes: &mut &[u8], depth: usize) -> ParseResult<Reply> {
    let line = parse_line(bytes)?;
    let declared = parse_number(line)?;

    if declared == -1 {
        return Ok(Reply::Array(None));
    }
    if declared < 0 {
        return invalid(format!("negative array length {declared}"));
    }

    let Ok(count) = usize::try_from(declared) else {
        return invalid(format!("array length {declared} exceeds limit"));
    };
    if count > MAX_FRAME_ELEMENTS {
        return invalid(format!("array length {count} exceeds limit"));
    }

    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(decode_reply(bytes, depth + 1)?);
    }
    Ok(Reply::Array(Some(items)))
}

/// Helper function to find the next CRLF sequence in a buffer.
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
