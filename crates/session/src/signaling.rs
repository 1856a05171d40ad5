//! Handshake and negotiation-relay state machine.
//!
//! The machine never touches sockets or threads. Each received token yields
//! a list of [`Action`]s that the endpoint carries out in order, hopping to
//! whichever thread an action belongs on.

use direct_protocol::{ProtocolMessage, Role, SessionConfig};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Listening,
    Connecting,
    Connected,
    Negotiating,
    Disconnected,
    ShuttingDown,
}

/// Progress of the counting self-test exchange. Reset on every new
/// connection and on disconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceCounters {
    pub ice_sent: u32,
    pub ice_received: u32,
    pub sdp_sent: u32,
    pub sdp_received: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountingLimits {
    pub max_ice_candidates: u32,
    pub max_sdp_fragments: u32,
}

impl CountingLimits {
    /// `None` unless the counting exchange is switched on.
    pub fn from_config(config: &SessionConfig) -> Option<Self> {
        config.counting_exchange.then_some(Self {
            max_ice_candidates: config.max_ice_candidates,
            max_sdp_fragments: config.max_sdp_fragments,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(ProtocolMessage),
    /// Start this side's negotiation (signaling thread).
    BeginNegotiation,
    SetRemoteDescription(String),
    AddRemoteCandidate(String),
    /// Close the negotiation session (signaling thread).
    TeardownSession,
    /// Drop the transport without reconnecting (network thread). Only the
    /// named connection is closed; a replacement accepted meanwhile stays.
    CloseTransport(Uuid),
    QuitRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("{role} received {token}, which only a {role} sends")]
    WrongRole { token: &'static str, role: Role },
    #[error("{0} with an empty payload")]
    EmptyPayload(&'static str),
    #[error("unrecognized message '{0}'")]
    Unrecognized(String),
}

pub struct SignalingStateMachine {
    role: Role,
    state: ConnectionState,
    counters: SequenceCounters,
    counting: Option<CountingLimits>,
    /// Connection the current exchange runs on.
    conn: Option<Uuid>,
}

impl SignalingStateMachine {
    pub fn new(role: Role, counting: Option<CountingLimits>) -> Self {
        Self {
            role,
            state: ConnectionState::Idle,
            counters: SequenceCounters::default(),
            counting,
            conn: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn counters(&self) -> SequenceCounters {
        self.counters
    }

    pub fn on_listening(&mut self) {
        self.set_state(ConnectionState::Listening);
    }

    pub fn on_connecting(&mut self) {
        self.set_state(ConnectionState::Connecting);
    }

    pub fn on_connected(&mut self, conn_id: Uuid) {
        self.conn = Some(conn_id);
        self.counters = SequenceCounters::default();
        self.set_state(ConnectionState::Connected);
    }

    pub fn on_connect_failed(&mut self) {
        self.set_state(ConnectionState::Disconnected);
    }

    /// The peer went away or the stream failed.
    pub fn on_transport_lost(&mut self) {
        self.counters = SequenceCounters::default();
        if self.state != ConnectionState::ShuttingDown {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// We closed the transport ourselves. A callee with a live listener goes
    /// straight back to waiting for the next caller.
    pub fn on_transport_closed(&mut self, listening: bool) {
        if self.state == ConnectionState::ShuttingDown {
            return;
        }
        self.set_state(if listening {
            ConnectionState::Listening
        } else {
            ConnectionState::Disconnected
        });
    }

    /// Token carrying a locally produced session description.
    pub fn local_description(&self, sdp: String) -> ProtocolMessage {
        match self.role {
            Role::Caller => ProtocolMessage::Offer(sdp),
            Role::Callee => ProtocolMessage::Answer(sdp),
        }
    }

    pub fn handle(&mut self, message: ProtocolMessage) -> Result<Vec<Action>, ProtocolViolation> {
        if self.state == ConnectionState::ShuttingDown {
            debug!(role = %self.role, token = message.kind(), "Ignoring message while shutting down");
            return Ok(Vec::new());
        }
        if message.sender() == Some(self.role) {
            return Err(ProtocolViolation::WrongRole {
                token: message.kind(),
                role: self.role,
            });
        }

        match message {
            ProtocolMessage::Hello => Ok(vec![Action::Send(ProtocolMessage::Welcome)]),
            ProtocolMessage::Welcome => Ok(vec![Action::Send(ProtocolMessage::Init)]),
            ProtocolMessage::Init => {
                self.set_state(ConnectionState::Negotiating);
                Ok(vec![
                    Action::BeginNegotiation,
                    Action::Send(ProtocolMessage::Waiting),
                ])
            }
            ProtocolMessage::Waiting => {
                self.set_state(ConnectionState::Negotiating);
                if self.counting.is_some() {
                    self.counters.ice_sent = 1;
                    Ok(vec![Action::Send(ProtocolMessage::Ice("1".to_string()))])
                } else {
                    Ok(vec![Action::BeginNegotiation])
                }
            }
            ProtocolMessage::Offer(sdp) | ProtocolMessage::Answer(sdp) if sdp.is_empty() => {
                let token = if self.role.is_caller() { "ANSWER" } else { "OFFER" };
                Err(ProtocolViolation::EmptyPayload(token))
            }
            ProtocolMessage::Offer(sdp) | ProtocolMessage::Answer(sdp) => {
                Ok(vec![Action::SetRemoteDescription(sdp)])
            }
            ProtocolMessage::Ice(_) if self.counting.is_some() => Ok(self.count_ice()),
            ProtocolMessage::Ice(candidate) if candidate.is_empty() => {
                Err(ProtocolViolation::EmptyPayload("ICE"))
            }
            ProtocolMessage::Ice(candidate) => Ok(vec![Action::AddRemoteCandidate(candidate)]),
            ProtocolMessage::Sdp(_) if self.counting.is_some() => Ok(self.count_sdp()),
            ProtocolMessage::IceAck(n) | ProtocolMessage::SdpAck(n) => {
                debug!(role = %self.role, n, "Acknowledged");
                Ok(Vec::new())
            }
            ProtocolMessage::Restart => {
                self.counters = SequenceCounters::default();
                self.set_state(ConnectionState::Negotiating);
                Ok(vec![
                    Action::TeardownSession,
                    Action::BeginNegotiation,
                    Action::Send(ProtocolMessage::Waiting),
                ])
            }
            ProtocolMessage::Bye => {
                let mut actions = vec![Action::Send(ProtocolMessage::Ok), Action::TeardownSession];
                if let Some(conn_id) = self.conn {
                    actions.push(Action::CloseTransport(conn_id));
                }
                if self.role.is_caller() {
                    self.set_state(ConnectionState::ShuttingDown);
                    actions.push(Action::QuitRuntime);
                }
                Ok(actions)
            }
            ProtocolMessage::Ok => match self.role {
                Role::Caller => {
                    self.set_state(ConnectionState::ShuttingDown);
                    Ok(vec![Action::TeardownSession, Action::QuitRuntime])
                }
                Role::Callee => Ok(vec![Action::TeardownSession]),
            },
            other => Err(ProtocolViolation::Unrecognized(other.to_string())),
        }
    }

    fn count_ice(&mut self) -> Vec<Action> {
        let Some(limits) = self.counting else {
            return Vec::new();
        };
        let c = &mut self.counters;
        c.ice_received += 1;
        let mut actions = vec![Action::Send(ProtocolMessage::IceAck(c.ice_received))];

        if c.ice_sent < limits.max_ice_candidates {
            c.ice_sent += 1;
            actions.push(Action::Send(ProtocolMessage::Ice(c.ice_sent.to_string())));
        } else if c.ice_received >= limits.max_ice_candidates && c.sdp_sent == 0 {
            c.sdp_sent = 1;
            actions.push(Action::Send(ProtocolMessage::Sdp("1".to_string())));
        }
        actions
    }

    fn count_sdp(&mut self) -> Vec<Action> {
        let Some(limits) = self.counting else {
            return Vec::new();
        };
        let c = &mut self.counters;
        c.sdp_received += 1;
        let mut actions = vec![Action::Send(ProtocolMessage::SdpAck(c.sdp_received))];

        if c.sdp_sent < limits.max_sdp_fragments {
            c.sdp_sent += 1;
            actions.push(Action::Send(ProtocolMessage::Sdp(c.sdp_sent.to_string())));
        } else if c.sdp_received >= limits.max_sdp_fragments {
            actions.push(Action::Send(ProtocolMessage::Bye));
        }
        actions
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(role = %self.role, from = ?self.state, to = ?state, "State change");
            self.state = state;
        }
    }
}
