// src/core/protocol/mod.rs

pub mod codec;
pub mod command;
pub mod reply;

pub use codec::ReplyCodec;
pub use command::{Command, ToArg};
pub use reply::Reply;
