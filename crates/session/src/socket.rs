//! Packet sockets over any async byte stream, plus the accepting listener.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use direct_protocol::{encode_packet, PacketDecoder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SessionError;

/// Anything a packet socket can run over: plain TCP or a TLS stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

pub type PacketCallback = Arc<dyn Fn(Uuid, Bytes, SocketAddr) + Send + Sync>;
/// `None` means the peer closed cleanly.
pub type CloseCallback = Arc<dyn Fn(Uuid, Option<io::ErrorKind>) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(PacketSocket) + Send + Sync>;

const READ_CHUNK: usize = 4096;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Callbacks {
    on_packet: Mutex<Option<PacketCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
    close_fired: AtomicBool,
}

impl Callbacks {
    fn packet(&self, id: Uuid, payload: Bytes, remote: SocketAddr) {
        let callback = lock(&self.on_packet).clone();
        match callback {
            Some(callback) => callback(id, payload, remote),
            None => debug!(%id, "Dropping packet, no receiver registered"),
        }
    }

    fn close(&self, id: Uuid, reason: Option<io::ErrorKind>) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = lock(&self.on_close).clone();
        if let Some(callback) = callback {
            callback(id, reason);
        }
    }
}

/// A connected stream that sends and receives whole packets.
///
/// Reading and writing run as tasks on the runtime passed to
/// [`PacketSocket::wrap`]. Closing the socket locally does not fire the close
/// event; only the peer going away or an I/O error does. Packets queued
/// before a local close are still flushed.
pub struct PacketSocket {
    id: Uuid,
    remote: SocketAddr,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    callbacks: Arc<Callbacks>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl PacketSocket {
    pub fn wrap(transport: Box<dyn Transport>, remote: SocketAddr, handle: &Handle) -> Self {
        let id = Uuid::new_v4();
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound, rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(Callbacks::default());

        let reader = handle.spawn(read_loop(id, remote, read_half, Arc::clone(&callbacks)));
        handle.spawn(write_loop(id, write_half, rx, Arc::clone(&callbacks)));
        debug!(%id, %remote, "Packet socket wrapped");

        Self {
            id,
            remote,
            outbound: Mutex::new(Some(outbound)),
            callbacks,
            reader,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue one packet. The whole payload is written or the socket closes.
    pub fn send(&self, payload: &[u8]) -> Result<usize, SessionError> {
        let packet = encode_packet(payload)?;
        let outbound = lock(&self.outbound);
        let Some(outbound) = outbound.as_ref() else {
            return Err(SessionError::Closed);
        };
        outbound.send(packet).map_err(|_| SessionError::Closed)?;
        Ok(payload.len())
    }

    pub fn register_received_packet_callback(&self, callback: PacketCallback) {
        *lock(&self.callbacks.on_packet) = Some(callback);
    }

    pub fn deregister_received_packet_callback(&self) {
        *lock(&self.callbacks.on_packet) = None;
    }

    pub fn subscribe_close_event(&self, callback: CloseCallback) {
        *lock(&self.callbacks.on_close) = Some(callback);
    }

    pub fn unsubscribe_close_event(&self) {
        *lock(&self.callbacks.on_close) = None;
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.callbacks.close_fired.store(true, Ordering::Release);
        // The writer drains what is queued, shuts down its half and exits;
        // once both halves are gone the stream itself is closed.
        lock(&self.outbound).take();
        self.reader.abort();
        debug!(id = %self.id, "Packet socket closed");
    }
}

impl Drop for PacketSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    id: Uuid,
    remote: SocketAddr,
    mut reader: ReadHalf<Box<dyn Transport>>,
    callbacks: Arc<Callbacks>,
) {
    let mut decoder = PacketDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                decoder.extend(&buf[..n]);
                while let Some(packet) = decoder.next_packet() {
                    callbacks.packet(id, packet, remote);
                }
            }
            Err(e) => {
                debug!(%id, "Read failed: {e}");
                break Some(e.kind());
            }
        }
    };
    if decoder.pending() > 0 {
        debug!(%id, pending = decoder.pending(), "Stream ended mid-packet");
    }
    callbacks.close(id, reason);
}

async fn write_loop(
    id: Uuid,
    mut writer: WriteHalf<Box<dyn Transport>>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    callbacks: Arc<Callbacks>,
) {
    while let Some(packet) = rx.recv().await {
        let result = match writer.write_all(&packet).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(%id, "Write failed: {e}");
            callbacks.close(id, Some(e.kind()));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Accepts inbound TCP connections and hands each one over as a
/// [`PacketSocket`].
pub struct ListenSocket {
    local: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenSocket {
    /// Take over an already bound and listening socket.
    pub fn wrap(
        listener: std::net::TcpListener,
        handle: &Handle,
        on_new_connection: ConnectionCallback,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let listener = {
            let _guard = handle.enter();
            tokio::net::TcpListener::from_std(listener)?
        };

        let accept_handle = handle.clone();
        let task = handle.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed: {e}");
                        }
                        let socket = PacketSocket::wrap(Box::new(stream), remote, &accept_handle);
                        on_new_connection(socket);
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        Ok(Self { local, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for ListenSocket {
    fn drop(&mut self) {
        self.close();
    }
}
