//! WebRTC-backed [`NegotiationEngine`].
//!
//! The engine is an actor: trait calls push commands onto an unbounded
//! channel and a single task on the signaling thread owns the peer
//! connection. webrtc-rs is async throughout, so this keeps every
//! negotiation step serialized without blocking the signaling queue.

use std::sync::Arc;

use anyhow::Context;
use direct_protocol::Role;
use direct_session::{NegotiationEngine, NegotiationHandle, TaskThread};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Label of the data channel the caller opens so the offer has a section
/// to negotiate.
const DATA_CHANNEL_LABEL: &str = "direct";

#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub stun_urls: Vec<String>,
    pub encryption: bool,
}

enum EngineCommand {
    Begin(Role, NegotiationHandle),
    RemoteDescription(String),
    RemoteCandidate(String),
    Close,
}

pub struct WebRtcEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl WebRtcEngine {
    /// Spawn the engine task on `thread`, which must already be running.
    pub fn start(thread: &TaskThread, config: PeerConfig) -> anyhow::Result<Arc<Self>> {
        if !config.encryption {
            warn!("Media encryption cannot be disabled, DTLS-SRTP stays on");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if !thread.spawn(run_engine(rx, config)) {
            anyhow::bail!("{} thread is not running", thread.name());
        }
        Ok(Arc::new(Self { commands: tx }))
    }

    fn send(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            warn!("Negotiation engine task has exited");
        }
    }
}

impl NegotiationEngine for WebRtcEngine {
    fn begin_negotiation(&self, role: Role, handle: NegotiationHandle) {
        self.send(EngineCommand::Begin(role, handle));
    }

    fn set_remote_description(&self, sdp: &str) {
        self.send(EngineCommand::RemoteDescription(sdp.to_string()));
    }

    fn add_remote_candidate(&self, candidate: &str) {
        self.send(EngineCommand::RemoteCandidate(candidate.to_string()));
    }

    fn close_session(&self) {
        self.send(EngineCommand::Close);
    }
}

async fn run_engine(mut rx: mpsc::UnboundedReceiver<EngineCommand>, config: PeerConfig) {
    let mut session: Option<PeerSession> = None;

    while let Some(command) = rx.recv().await {
        match command {
            EngineCommand::Begin(role, handle) => {
                if let Some(old) = session.take() {
                    old.close().await;
                }
                match PeerSession::open(role, handle, &config).await {
                    Ok(opened) => session = Some(opened),
                    Err(e) => error!(%role, "Failed to begin negotiation: {e:#}"),
                }
            }
            EngineCommand::RemoteDescription(sdp) => match session.as_mut() {
                Some(s) => {
                    if let Err(e) = s.apply_remote_description(sdp).await {
                        error!(role = %s.role, "Remote description rejected: {e:#}");
                    }
                }
                None => warn!("Remote description arrived with no session"),
            },
            EngineCommand::RemoteCandidate(candidate) => match session.as_mut() {
                Some(s) => {
                    if let Err(e) = s.add_candidate(candidate).await {
                        warn!(role = %s.role, "Remote candidate rejected: {e:#}");
                    }
                }
                None => debug!("Remote candidate arrived with no session"),
            },
            EngineCommand::Close => {
                if let Some(s) = session.take() {
                    s.close().await;
                }
            }
        }
    }

    if let Some(s) = session.take() {
        s.close().await;
    }
    debug!("Negotiation engine task exiting");
}

struct PeerSession {
    role: Role,
    peer_connection: Arc<RTCPeerConnection>,
    handle: NegotiationHandle,
    remote_set: bool,
    /// Candidates that arrived before the remote description.
    pending_candidates: Vec<String>,
    _data_channel: Option<Arc<RTCDataChannel>>,
}

impl PeerSession {
    async fn open(
        role: Role,
        handle: NegotiationHandle,
        config: &PeerConfig,
    ) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.stun_urls.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .context("Failed to create peer connection")?,
        );

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!(%role, "Peer connection failed"),
                RTCPeerConnectionState::Disconnected => {
                    warn!(%role, "Peer connection disconnected (ICE reconnecting)")
                }
                _ => info!(%role, ?state, "Peer connection state changed"),
            }
            Box::pin(async {})
        }));

        let candidate_handle = handle.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => candidate_handle.local_candidate_ready(json.candidate),
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        peer_connection.on_data_channel(Box::new(|dc: Arc<RTCDataChannel>| {
            Box::pin(async move {
                info!(label = dc.label(), "Remote data channel opened");
            })
        }));

        let mut session = Self {
            role,
            peer_connection,
            handle,
            remote_set: false,
            pending_candidates: Vec::new(),
            _data_channel: None,
        };

        if role.is_caller() {
            session.make_offer().await?;
        } else {
            info!("Waiting for offer");
        }
        Ok(session)
    }

    async fn make_offer(&mut self) -> anyhow::Result<()> {
        let channel = self
            .peer_connection
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .context("Failed to create data channel")?;
        channel.on_open(Box::new(|| {
            Box::pin(async {
                info!("Data channel open");
            })
        }));
        self._data_channel = Some(channel);

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        info!("Local offer set");
        self.handle.local_description_ready(offer.sdp);
        Ok(())
    }

    /// Apply the peer's OFFER (callee) or ANSWER (caller). The callee
    /// answers straight away.
    async fn apply_remote_description(&mut self, sdp: String) -> anyhow::Result<()> {
        let description = if self.role.is_caller() {
            RTCSessionDescription::answer(sdp).context("Failed to parse SDP answer")?
        } else {
            RTCSessionDescription::offer(sdp).context("Failed to parse SDP offer")?
        };
        self.peer_connection
            .set_remote_description(description)
            .await
            .context("Failed to set remote description")?;
        self.remote_set = true;
        info!(role = %self.role, "Remote description set");

        if !self.role.is_caller() {
            let answer = self
                .peer_connection
                .create_answer(None)
                .await
                .context("Failed to create answer")?;
            self.peer_connection
                .set_local_description(answer.clone())
                .await
                .context("Failed to set local description")?;
            self.handle.local_description_ready(answer.sdp);
        }

        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.add_candidate(candidate).await {
                warn!("Queued candidate rejected: {e:#}");
            }
        }
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: String) -> anyhow::Result<()> {
        if !self.remote_set {
            debug!("Queuing ICE candidate, descriptions not ready");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        debug!("ICE candidate added");
        Ok(())
    }

    async fn close(self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close peer connection: {e}");
        }
        info!(role = %self.role, "Negotiation session closed");
    }
}
