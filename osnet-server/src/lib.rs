//! # osnet-server
//!
//! TCP server for osnet.
//!
//! This crate provides:
//! - TCP and in-process connection handling with async I/O
//! - Frame decoding and dispatch by message type, replies keyed by correlation id
//! - Session management and handshake
//! - The remote stream registry and its resource backends
//! - YAML/env configuration and Prometheus metrics

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod registry;
pub mod resource;
pub mod server;
pub mod session;
pub mod stream;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, StreamsConfig};
pub use error::ServerError;
pub use handler::{CommandHandler, CustomHandler, ServerInfo};
pub use metrics::Metrics;
pub use registry::StreamRegistry;
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
pub use stream::ServerStream;
