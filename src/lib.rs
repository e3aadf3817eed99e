// src/lib.rs

pub mod client;
pub mod config;
pub mod connection;
pub mod core;

// Re-export
pub use crate::client::{Client, Commands, Executor};
pub use crate::config::ClientConfig;
pub use crate::core::pipeline::Pipeline;
pub use crate::core::pubsub::{Message, Subscriber};
pub use crate::core::{ClientError, Command, Reply};
