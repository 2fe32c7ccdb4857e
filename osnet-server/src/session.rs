//! Session management.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for HELLO.
    Connected,
    /// Handshake complete, ready for requests.
    Ready,
    /// Client said BYE; the connection closes after the reply.
    Closing,
}

/// A client session. One per connection.
///
/// The session id owns every stream handle opened on the connection.
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    /// Negotiated protocol version.
    protocol_version: u16,

    /// Client name from HELLO.
    client_name: Option<String>,

    request_count: AtomicU64,

    created_at: Instant,

    last_activity: Mutex<Instant>,
}

impl Session {
    /// Creates a new session.
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: SessionState::Connected,
            protocol_version: 0,
            client_name: None,
            request_count: AtomicU64::new(0),
            created_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sets the session state.
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Returns whether the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Completes the handshake.
    pub fn complete_handshake(&mut self, protocol_version: u16, client_name: Option<String>) {
        self.protocol_version = protocol_version;
        self.client_name = client_name;
        self.state = SessionState::Ready;
    }

    /// Records a request.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
