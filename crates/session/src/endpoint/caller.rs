use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Deref;
use std::sync::Arc;

use direct_protocol::{PeerAddress, ProtocolMessage, Role};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{Endpoint, EndpointOptions, Inner, lock};
use crate::error::{SessionError, SetupStage};
use crate::negotiation::NegotiationEngine;
use crate::runtime::{RuntimeError, ThreadRuntime};
use crate::socket::{PacketSocket, Transport};
use crate::tls::{self, TlsOptions};

/// Dials the callee, opens the handshake and makes the offer.
pub struct Caller {
    endpoint: Endpoint,
}

impl Caller {
    pub fn new(
        runtime: Arc<ThreadRuntime>,
        engine: Arc<dyn NegotiationEngine>,
        options: EndpointOptions,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(Role::Caller, runtime, engine, options),
        }
    }

    /// Connect to `target` and send HELLO. Blocks until the transport is up
    /// or setup fails. The target is kept for reconnects.
    pub fn connect(&self, target: PeerAddress) -> Result<(), SessionError> {
        *lock(&self.endpoint.inner.target) = Some(target);
        let inner = Arc::clone(&self.endpoint.inner);
        self.endpoint
            .inner
            .network()
            .blocking_call_async(move || async move { establish(&inner).await })?
    }
}

impl Deref for Caller {
    type Target = Endpoint;

    fn deref(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Open the transport to the stored target and install it. Runs on the
/// network thread.
pub(super) async fn establish(inner: &Arc<Inner>) -> Result<(), SessionError> {
    let target = lock(&inner.target).clone().ok_or(SessionError::NoTarget)?;
    inner.machine().on_connecting();

    let (transport, remote) = match open_transport(&target, &inner.options.tls).await {
        Ok(opened) => opened,
        Err(e) => {
            inner.machine().on_connect_failed();
            return Err(e);
        }
    };

    let handle = inner.network().handle().ok_or_else(|| RuntimeError::NotRunning {
        name: inner.network().name().to_string(),
    })?;
    let socket = PacketSocket::wrap(transport, remote, &handle);
    info!(conn_id = %socket.id(), %target, %remote, "Connected");
    inner.install_socket(socket);

    inner.send_message(&ProtocolMessage::Hello)
}

async fn open_transport(
    target: &PeerAddress,
    tls_options: &TlsOptions,
) -> Result<(Box<dyn Transport>, SocketAddr), SessionError> {
    let addr = resolve(target)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| SessionError::setup(SetupStage::Create, e))?;
    if target.is_url()
        && let Err(e) = socket.set_keepalive(true)
    {
        warn!("SO_KEEPALIVE failed: {e}");
    }
    socket
        .connect(&addr.into())
        .map_err(|e| SessionError::setup(SetupStage::Connect, e))?;

    let stream: std::net::TcpStream = socket.into();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    stream
        .set_nonblocking(true)
        .map_err(|e| SessionError::setup(SetupStage::Wrap, e))?;
    let stream =
        TcpStream::from_std(stream).map_err(|e| SessionError::setup(SetupStage::Wrap, e))?;

    if target.is_secure() {
        let stream = tls::secure_handshake(stream, &target.host, tls_options).await?;
        Ok((Box::new(stream), addr))
    } else {
        Ok((Box::new(stream), addr))
    }
}

/// Resolve the target host, preferring IPv4.
fn resolve(target: &PeerAddress) -> Result<SocketAddr, SessionError> {
    let addrs: Vec<SocketAddr> = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| SessionError::setup(SetupStage::Resolve, e))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            SessionError::setup(
                SetupStage::Resolve,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", target.host),
                ),
            )
        })
}
