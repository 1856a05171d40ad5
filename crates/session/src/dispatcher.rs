//! Routes socket events onto the network thread.
//!
//! Socket callbacks may fire on whatever thread polls the stream. Every
//! event is funneled through [`execute_on`] so that the handler only ever
//! runs on the network thread, in arrival order.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

use crate::runtime::TaskThread;
use crate::socket::PacketSocket;

/// Run `f` on `thread`: inline if already there, otherwise queued behind
/// whatever that thread has pending.
pub fn execute_on(thread: &TaskThread, f: impl FnOnce() + Send + 'static) -> bool {
    if thread.is_current() {
        f();
        true
    } else {
        thread.post(f)
    }
}

/// Receives decoded socket events, always on the network thread.
pub trait SocketHandler: Send + Sync + 'static {
    fn on_message(self: Arc<Self>, conn_id: Uuid, text: String, remote: SocketAddr);
    fn on_close(self: Arc<Self>, conn_id: Uuid, reason: Option<io::ErrorKind>);
}

pub struct MessageDispatcher {
    network: Arc<TaskThread>,
}

impl MessageDispatcher {
    pub fn new(network: Arc<TaskThread>) -> Self {
        Self { network }
    }

    /// Route `socket`'s packets and close event to `handler`. Holds only a
    /// weak reference, so the socket never keeps its owner alive.
    pub fn attach<H: SocketHandler>(&self, socket: &PacketSocket, handler: Weak<H>) {
        let network = Arc::clone(&self.network);
        let packet_handler = handler.clone();
        socket.register_received_packet_callback(Arc::new(move |id: Uuid, payload: Bytes, remote: SocketAddr| {
            let handler = packet_handler.clone();
            execute_on(&network, move || deliver_packet(&handler, id, payload, remote));
        }));

        let network = Arc::clone(&self.network);
        socket.subscribe_close_event(Arc::new(move |id: Uuid, reason: Option<io::ErrorKind>| {
            let handler = handler.clone();
            execute_on(&network, move || {
                if let Some(handler) = handler.upgrade() {
                    handler.on_close(id, reason);
                }
            });
        }));
    }

    pub fn detach(socket: &PacketSocket) {
        socket.deregister_received_packet_callback();
        socket.unsubscribe_close_event();
    }
}

fn deliver_packet<H: SocketHandler>(
    handler: &Weak<H>,
    id: Uuid,
    payload: Bytes,
    remote: SocketAddr,
) {
    let Some(handler) = handler.upgrade() else {
        return;
    };
    match decode_text(&payload) {
        Some(text) => handler.on_message(id, text, remote),
        None => warn!(conn_id = %id, len = payload.len(), "Dropping non-UTF-8 packet"),
    }
}

pub fn decode_text(payload: &[u8]) -> Option<String> {
    std::str::from_utf8(payload).ok().map(str::to_string)
}
