//! Core relay engine
//!
//! This module contains the relay functionality shared by both transports:
//! - Duplex forwarding with idle deadlines and filtering
//! - UDP session table
//! - Shared relay state

pub mod relay;
mod server;
pub mod session;

pub use relay::{
    forward, forward_datagrams, relay_pair, ActivityClock, Direction, ForwardOptions,
    ForwardReport, PairReport, Termination,
};
pub use server::{Relay, RelayBuilder};
pub use session::{Session, SessionId, SessionTable};
