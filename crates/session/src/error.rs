use std::fmt;
use std::io;

use direct_protocol::FrameError;
use tracing::error;

use crate::runtime::RuntimeError;

/// Which step of socket setup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    Create,
    Bind,
    Listen,
    Resolve,
    Connect,
    Wrap,
    Tls,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetupStage::Create => "socket creation",
            SetupStage::Bind => "bind",
            SetupStage::Listen => "listen",
            SetupStage::Resolve => "address resolution",
            SetupStage::Connect => "connect",
            SetupStage::Wrap => "socket wrap",
            SetupStage::Tls => "TLS handshake",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{stage} failed: {source}")]
    Setup {
        stage: SetupStage,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("socket is not connected")]
    NotConnected,
    #[error("transport is closed")]
    Closed,
    #[error("no target address set")]
    NoTarget,
    #[error("invalid TLS server name '{0}'")]
    ServerName(String),
}

impl SessionError {
    /// Log a setup failure with its OS error code and wrap it.
    pub(crate) fn setup(stage: SetupStage, source: io::Error) -> Self {
        error!(
            %stage,
            errno = source.raw_os_error().unwrap_or_default(),
            "Socket setup failed: {source}"
        );
        SessionError::Setup { stage, source }
    }

    pub fn stage(&self) -> Option<SetupStage> {
        match self {
            SessionError::Setup { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            SessionError::Setup { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
