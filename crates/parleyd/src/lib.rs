//! parleyd - parley peer messaging daemon
//!
//! This daemon provides:
//! - A TCP endpoint for encrypted peer messaging
//! - Built-in `ping`, `echo` and `profile` handlers
//! - Structured logging of peer and endpoint events

pub mod config;
pub mod node;

pub use config::Config;
pub use node::Node;
