//! TCP/UDP relay with idle timeouts and content filtering
//!
//! Architecture:
//! - `core/`: Forwarding loops, datagram session table and shared relay state
//! - `filter`: Drop/exclude/replace rules applied to every chunk
//! - `handler`: Per-connection and per-datagram processing
//! - `server_runner`: Listener startup and the accept/receive loops

pub mod config;
pub mod core;
pub mod error;
pub mod filter;
pub mod handler;
pub mod logger;
pub mod server_runner;

pub use error::{RelayError, Result};
