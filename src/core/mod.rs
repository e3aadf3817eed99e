// src/core/mod.rs

//! The central module containing the protocol, error types and the executors
//! that sit between callers and a connection.

pub mod errors;
pub mod mux;
pub mod pipeline;
pub mod protocol;
pub mod pubsub;

pub use errors::ClientError;
pub use protocol::{Command, Reply};
