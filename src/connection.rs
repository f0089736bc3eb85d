//! Connection state tracking for authenticated TCP flows.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::trace;

use crate::context::PuContext;
use crate::policy::FlowPolicy;

/// Length of the per-connection challenge nonce.
pub const CONTEXT_NONCE_LEN: usize = 32;

/// Handshake state of an authenticated TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlowState {
    /// SYN with auth data sent toward the network
    SynSend,
    /// SYN with a valid token accepted from the network
    SynReceived,
    /// SYN-ACK with auth data sent toward the network
    SynAckSend,
    /// SYN-ACK with a valid token accepted from the network
    SynAckReceived,
    /// Final ACK with the dual-nonce token sent
    AckSend,
    /// Handshake complete, segments pass unmodified
    Data,
}

/// Authentication material bound to one connection.
///
/// `local_context` is generated at connection creation and sent inside our
/// tokens; `remote_context` is captured when the peer's first token is
/// accepted. The final ACK token signs both, binding the handshake to this
/// connection pair.
pub struct AuthInfo {
    /// Challenge nonce we emit
    pub local_context: Vec<u8>,
    /// Challenge nonce received from the peer
    pub remote_context: Vec<u8>,
    /// Our identity string
    pub local_context_id: String,
    /// Peer identity string from the transmitter claim
    pub remote_context_id: String,
    /// Opaque peer certificate captured during token parsing
    pub remote_public_key: Option<Vec<u8>>,
    /// Peer address rendered for reporting
    pub remote_ip: String,
    /// Peer port rendered for reporting
    pub remote_port: String,
}

impl AuthInfo {
    fn new() -> Self {
        let mut nonce = vec![0u8; CONTEXT_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            local_context: nonce,
            remote_context: Vec::new(),
            local_context_id: String::new(),
            remote_context_id: String::new(),
            remote_public_key: None,
            remote_ip: String::new(),
            remote_port: String::new(),
        }
    }
}

/// State for one TCP connection traversing the datapath.
pub struct TcpConnection {
    state: TcpFlowState,
    /// Authentication material for the connection
    pub auth: AuthInfo,
    /// Non-owning reference to the owning processing unit
    pub context: Weak<PuContext>,
    /// Policy cached when the flow was authorized
    pub flow_policy: Option<Arc<FlowPolicy>>,
    /// Flow stays observed after handshake for a service plugin
    pub service_connection: bool,
    /// Extended cache TTL for service connections
    pub time_out: Option<Duration>,
}

/// A connection shared between caches and packet workers. Handlers hold
/// the lock from resolution to verdict.
pub type SharedConnection = Arc<Mutex<TcpConnection>>;

impl TcpConnection {
    /// Create a connection in the initial `SynSend` state with a fresh
    /// local nonce.
    pub fn new() -> SharedConnection {
        Arc::new(Mutex::new(Self {
            state: TcpFlowState::SynSend,
            auth: AuthInfo::new(),
            context: Weak::new(),
            flow_policy: None,
            service_connection: false,
            time_out: None,
        }))
    }

    /// Current handshake state.
    pub fn state(&self) -> TcpFlowState {
        self.state
    }

    /// Transition the handshake state.
    pub fn set_state(&mut self, state: TcpFlowState) {
        trace!(from = ?self.state, to = ?state, "connection state transition");
        self.state = state;
    }
}
