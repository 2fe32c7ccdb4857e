//! # osnet-client
//!
//! Client library for osnet.
//!
//! This crate provides:
//! - Async connection with one background receive loop and correlated replies
//! - A dispatcher matching replies to waiting callers by correlation id
//! - Remote streams: server-side byte streams driven like local ones
//! - A `std::io` adapter for synchronous callers

pub mod blocking;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod remote;
pub mod stream;

#[cfg(test)]
mod testing;

pub use blocking::BlockingRemoteStream;
pub use client::Client;
pub use connection::{Connection, ConnectionConfig, PendingReply};
pub use dispatcher::{Dispatcher, Resolved};
pub use error::ClientError;
pub use remote::{RemoteStream, StreamState};
pub use stream::ClientStream;
