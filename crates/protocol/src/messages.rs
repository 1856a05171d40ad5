use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the call this process plays. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Initiates the TCP connection and the negotiation offer.
    Caller,
    /// Listens for the caller and answers.
    Callee,
}

impl Role {
    pub fn is_caller(self) -> bool {
        matches!(self, Role::Caller)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Caller => "caller",
            Role::Callee => "callee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "caller" => Ok(Role::Caller),
            "callee" => Ok(Role::Callee),
            other => Err(format!("invalid mode '{other}' (expected caller or callee)")),
        }
    }
}

pub const OFFER_PREFIX: &str = "OFFER:";
pub const ANSWER_PREFIX: &str = "ANSWER:";
pub const ICE_PREFIX: &str = "ICE:";
pub const SDP_PREFIX: &str = "SDP:";
pub const ICE_ACK_PREFIX: &str = "ICE_ACK:";
pub const SDP_ACK_PREFIX: &str = "SDP_ACK:";

/// One handshake token, decoded once from the text of a received packet.
///
/// Bare keywords must match exactly; prefixed tokens carry everything after
/// the first `:` as an opaque payload (which may be empty, callers decide
/// whether that is an error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Hello,
    Welcome,
    Init,
    Waiting,
    Offer(String),
    Answer(String),
    Ice(String),
    /// Counting-exchange fragment (`SDP:<n>`).
    Sdp(String),
    IceAck(u32),
    SdpAck(u32),
    /// Caller asks the callee to drop the current negotiation and start
    /// a fresh one on the same connection.
    Restart,
    Bye,
    Ok,
    Unknown(String),
}

impl ProtocolMessage {
    pub fn decode(text: &str) -> Self {
        match text {
            "HELLO" => return Self::Hello,
            "WELCOME" => return Self::Welcome,
            "INIT" => return Self::Init,
            "WAITING" => return Self::Waiting,
            "RESTART" => return Self::Restart,
            "BYE" => return Self::Bye,
            "OK" => return Self::Ok,
            _ => {}
        }

        // ACK prefixes are checked before the payload-carrying ones.
        if let Some(n) = text.strip_prefix(ICE_ACK_PREFIX) {
            return n
                .parse()
                .map(Self::IceAck)
                .unwrap_or_else(|_| Self::Unknown(text.to_string()));
        }
        if let Some(n) = text.strip_prefix(SDP_ACK_PREFIX) {
            return n
                .parse()
                .map(Self::SdpAck)
                .unwrap_or_else(|_| Self::Unknown(text.to_string()));
        }
        if let Some(sdp) = text.strip_prefix(OFFER_PREFIX) {
            return Self::Offer(sdp.to_string());
        }
        if let Some(sdp) = text.strip_prefix(ANSWER_PREFIX) {
            return Self::Answer(sdp.to_string());
        }
        if let Some(candidate) = text.strip_prefix(ICE_PREFIX) {
            return Self::Ice(candidate.to_string());
        }
        if let Some(fragment) = text.strip_prefix(SDP_PREFIX) {
            return Self::Sdp(fragment.to_string());
        }
        Self::Unknown(text.to_string())
    }

    /// Short name used in logs; never includes the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Welcome => "WELCOME",
            Self::Init => "INIT",
            Self::Waiting => "WAITING",
            Self::Offer(_) => "OFFER",
            Self::Answer(_) => "ANSWER",
            Self::Ice(_) => "ICE",
            Self::Sdp(_) => "SDP",
            Self::IceAck(_) => "ICE_ACK",
            Self::SdpAck(_) => "SDP_ACK",
            Self::Restart => "RESTART",
            Self::Bye => "BYE",
            Self::Ok => "OK",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// The role that is allowed to send this token, if only one is.
    pub fn sender(&self) -> Option<Role> {
        match self {
            Self::Hello | Self::Init | Self::Offer(_) | Self::Restart => Some(Role::Caller),
            Self::Welcome | Self::Waiting | Self::Answer(_) => Some(Role::Callee),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer(sdp) => write!(f, "{OFFER_PREFIX}{sdp}"),
            Self::Answer(sdp) => write!(f, "{ANSWER_PREFIX}{sdp}"),
            Self::Ice(candidate) => write!(f, "{ICE_PREFIX}{candidate}"),
            Self::Sdp(fragment) => write!(f, "{SDP_PREFIX}{fragment}"),
            Self::IceAck(n) => write!(f, "{ICE_ACK_PREFIX}{n}"),
            Self::SdpAck(n) => write!(f, "{SDP_ACK_PREFIX}{n}"),
            Self::Unknown(raw) => f.write_str(raw),
            other => f.write_str(other.kind()),
        }
    }
}
