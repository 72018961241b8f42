//! Transport session state machine.
//!
//! `Connecting -> Handshaking -> Ready -> Closing -> Closed`
//!
//! This type owns no socket. The WebSocket driver in
//! [`crate::link_proto::client`] feeds it events and writes whatever frames
//! it hands back, which keeps buffering and addressing rules testable
//! without a network.

use std::collections::VecDeque;

use tracing::debug;

use crate::link_proto::rpc::{Envelope, OutboundMessage, Setup};

/// Value of the `init` field on the setup frame.
pub const INIT_MARKER: &str = concat!("evallink-rs/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    plugin_id: Option<String>,
    /// Messages produced before the peer id was known, oldest first.
    pending: VecDeque<OutboundMessage>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            plugin_id: None,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    /// Number of messages waiting for the handshake.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Produce the setup frame and start waiting for a peer id.
    pub fn open(&mut self, setup: Setup) -> Envelope<OutboundMessage> {
        self.state = SessionState::Handshaking;
        Envelope::new(OutboundMessage::Setup(setup)).with_init(INIT_MARKER)
    }

    /// Submit an outbound message.
    ///
    /// Returns the frame to write now when the session is Ready. Before
    /// that the message is buffered; after close it is dropped.
    pub fn outbound(&mut self, message: OutboundMessage) -> Option<Envelope<OutboundMessage>> {
        match self.state {
            SessionState::Ready => Some(self.address(message)),
            SessionState::Connecting | SessionState::Handshaking => {
                self.pending.push_back(message);
                None
            }
            SessionState::Closing | SessionState::Closed => {
                debug!("dropping outbound message on closed session");
                None
            }
        }
    }

    /// Record the peer id assigned by the orchestrator.
    ///
    /// The first assignment moves the session to Ready and returns every
    /// buffered message in the order it was submitted.
    pub fn complete_handshake(&mut self, plugin_id: String) -> Vec<Envelope<OutboundMessage>> {
        if self.is_closed() {
            return Vec::new();
        }

        self.plugin_id = Some(plugin_id);
        self.state = SessionState::Ready;

        let pending = std::mem::take(&mut self.pending);
        pending.into_iter().map(|m| self.address(m)).collect()
    }

    /// Whether an inbound frame addressed to `for_peer` belongs to this session.
    pub fn accepts(&self, for_peer: Option<&str>) -> bool {
        match (for_peer, self.plugin_id.as_deref()) {
            (Some(target), Some(ours)) => target == ours,
            _ => true,
        }
    }

    /// Start closing. Returns `true` only for the first request.
    pub fn begin_close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = SessionState::Closing;
        self.pending.clear();
        true
    }

    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn address(&self, message: OutboundMessage) -> Envelope<OutboundMessage> {
        let envelope = Envelope::new(message);
        match &self.plugin_id {
            Some(id) => envelope.addressed_to(id.clone()),
            None => envelope,
        }
    }
}
