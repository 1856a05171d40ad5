//! Connection lifecycle for a direct two-party call: thread runtime, packet
//! sockets, the handshake state machine and caller/callee endpoints.

pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod negotiation;
pub mod reconnect;
pub mod runtime;
pub mod signaling;
pub mod socket;
pub mod tls;

pub use endpoint::{Callee, Caller, Endpoint, EndpointOptions};
pub use error::{SessionError, SetupStage};
pub use negotiation::{LoggingEngine, NegotiationEngine, NegotiationHandle, NegotiationSink};
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
pub use runtime::{Event, RuntimeError, TaskThread, ThreadRuntime};
pub use signaling::{
    Action, ConnectionState, CountingLimits, ProtocolViolation, SequenceCounters,
    SignalingStateMachine,
};
pub use socket::{ListenSocket, PacketSocket, Transport};
pub use tls::TlsOptions;
