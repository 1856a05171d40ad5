use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Deref;
use std::sync::Arc;

use direct_protocol::Role;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use super::{Endpoint, EndpointOptions, Inner, lock};
use crate::error::{SessionError, SetupStage};
use crate::negotiation::NegotiationEngine;
use crate::runtime::{RuntimeError, ThreadRuntime};
use crate::socket::{ListenSocket, PacketSocket};

/// Listens for a caller and answers its negotiation.
pub struct Callee {
    endpoint: Endpoint,
}

impl Callee {
    pub fn new(
        runtime: Arc<ThreadRuntime>,
        engine: Arc<dyn NegotiationEngine>,
        options: EndpointOptions,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(Role::Callee, runtime, engine, options),
        }
    }

    /// Bind all interfaces on `port` (0 picks a free one) and start
    /// accepting. Returns the bound address.
    pub fn start_listening(&self, port: u16) -> Result<SocketAddr, SessionError> {
        let inner = Arc::clone(&self.endpoint.inner);
        self.endpoint
            .inner
            .network()
            .blocking_call(move || listen(&inner, port))?
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.endpoint.inner.listener)
            .as_ref()
            .map(ListenSocket::local_addr)
    }
}

impl Deref for Callee {
    type Target = Endpoint;

    fn deref(&self) -> &Endpoint {
        &self.endpoint
    }
}

fn listen(inner: &Arc<Inner>, port: u16) -> Result<SocketAddr, SessionError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| SessionError::setup(SetupStage::Create, e))?;
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("SO_REUSEADDR failed: {e}");
    }
    socket
        .bind(&addr.into())
        .map_err(|e| SessionError::setup(SetupStage::Bind, e))?;
    socket
        .listen(inner.options.listen_backlog)
        .map_err(|e| SessionError::setup(SetupStage::Listen, e))?;

    let handle = inner.network().handle().ok_or_else(|| RuntimeError::NotRunning {
        name: inner.network().name().to_string(),
    })?;
    let weak = Arc::downgrade(inner);
    let listener = ListenSocket::wrap(
        socket.into(),
        &handle,
        Arc::new(move |socket: PacketSocket| {
            if let Some(inner) = weak.upgrade() {
                on_new_connection(&inner, socket);
            }
        }),
    )
    .map_err(|e| SessionError::setup(SetupStage::Wrap, e))?;

    let local = listener.local_addr();
    *lock(&inner.listener) = Some(listener);
    inner.machine().on_listening();
    info!(port = local.port(), backlog = inner.options.listen_backlog, "Server listening");
    Ok(local)
}

fn on_new_connection(inner: &Arc<Inner>, socket: PacketSocket) {
    let network = inner.network();
    if !network.is_current() {
        let inner = Arc::clone(inner);
        network.post(move || on_new_connection(&inner, socket));
        return;
    }
    info!(
        conn_id = %socket.id(),
        remote = %socket.remote_addr(),
        "New connection accepted, waiting for HELLO"
    );
    inner.install_socket(socket);
}
