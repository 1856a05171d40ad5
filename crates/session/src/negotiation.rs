//! Seam between the signaling channel and the media negotiation engine.

use std::sync::{Arc, Mutex, Weak};

use direct_protocol::Role;
use tracing::{debug, info};

/// The peer-connection side of a call. Every method is invoked on the
/// signaling thread.
pub trait NegotiationEngine: Send + Sync + 'static {
    /// Create a fresh session. The caller side produces an offer, the callee
    /// side waits for one. Locally produced descriptions and candidates are
    /// reported through `handle`.
    fn begin_negotiation(&self, role: Role, handle: NegotiationHandle);
    fn set_remote_description(&self, sdp: &str);
    fn add_remote_candidate(&self, candidate: &str);
    fn close_session(&self);
}

/// Where an engine's local output goes.
pub trait NegotiationSink: Send + Sync + 'static {
    fn local_description_ready(self: Arc<Self>, sdp: String);
    fn local_candidate_ready(self: Arc<Self>, candidate: String);
}

/// Cloneable reference an engine keeps to report local output. Becomes a
/// no-op once the endpoint is gone.
#[derive(Clone)]
pub struct NegotiationHandle {
    sink: Weak<dyn NegotiationSink>,
}

impl NegotiationHandle {
    pub fn new(sink: Weak<dyn NegotiationSink>) -> Self {
        Self { sink }
    }

    pub fn local_description_ready(&self, sdp: String) {
        match self.sink.upgrade() {
            Some(sink) => sink.local_description_ready(sdp),
            None => debug!("Dropping local description, endpoint gone"),
        }
    }

    pub fn local_candidate_ready(&self, candidate: String) {
        match self.sink.upgrade() {
            Some(sink) => sink.local_candidate_ready(candidate),
            None => debug!("Dropping local candidate, endpoint gone"),
        }
    }
}

/// Engine that only logs. Used when the counting exchange stands in for
/// real negotiation.
#[derive(Default)]
pub struct LoggingEngine {
    role: Mutex<Option<Role>>,
}

impl LoggingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl NegotiationEngine for LoggingEngine {
    fn begin_negotiation(&self, role: Role, _handle: NegotiationHandle) {
        *self.role.lock().unwrap_or_else(|e| e.into_inner()) = Some(role);
        info!(%role, "Negotiation started");
    }

    fn set_remote_description(&self, sdp: &str) {
        info!(len = sdp.len(), "Remote description received");
    }

    fn add_remote_candidate(&self, candidate: &str) {
        debug!(candidate, "Remote candidate received");
    }

    fn close_session(&self) {
        if let Some(role) = self.role.lock().unwrap_or_else(|e| e.into_inner()).take() {
            info!(%role, "Negotiation session closed");
        }
    }
}
