use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub ice: IceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How many times a caller re-dials after its transport drops
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts, in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Whether a dropped caller should re-dial at all
    #[serde(default = "default_true")]
    pub reconnect: bool,
    /// Backlog passed to listen(2) by the callee
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,
    /// Candidates each side sends in the counting exchange
    #[serde(default = "default_max_ice_candidates")]
    pub max_ice_candidates: u32,
    /// Fragments each side sends in the counting exchange
    #[serde(default = "default_max_sdp_fragments")]
    pub max_sdp_fragments: u32,
    /// Route ICE:/SDP: tokens to the counting self-test instead of the
    /// negotiation engine.
    #[serde(default)]
    pub counting_exchange: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate trusted in addition to the platform roots
    pub pinned_cert: Option<String>,
}

/// STUN servers handed to the negotiation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect: true,
            listen_backlog: default_listen_backlog(),
            max_ice_candidates: default_max_ice_candidates(),
            max_sdp_fragments: default_max_sdp_fragments(),
            counting_exchange: false,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
        }
    }
}

impl DirectConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the process should not
    /// start) or "WARNING:" (advisory).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Reconnect ---
        if self.session.reconnect_delay_ms == 0 {
            issues.push(
                "ERROR: session.reconnect_delay_ms must be at least 1 millisecond.".to_string(),
            );
        }
        if self.session.max_reconnect_attempts > 100 {
            issues.push(format!(
                "WARNING: session.max_reconnect_attempts is {}, so a dead callee will be \
                 re-dialed for a long time. Typical values: 3-10.",
                self.session.max_reconnect_attempts
            ));
        }
        if self.session.reconnect && self.session.max_reconnect_attempts == 0 {
            issues.push(
                "WARNING: session.reconnect is enabled but max_reconnect_attempts is 0, \
                 so the caller will never re-dial."
                    .to_string(),
            );
        }

        // --- Listen backlog ---
        if self.session.listen_backlog < 1 {
            issues.push(format!(
                "ERROR: session.listen_backlog must be >= 1, got {}.",
                self.session.listen_backlog
            ));
        }

        // --- Counting exchange ---
        if self.session.counting_exchange
            && (self.session.max_ice_candidates == 0 || self.session.max_sdp_fragments == 0)
        {
            issues.push(
                "ERROR: counting_exchange needs max_ice_candidates and max_sdp_fragments >= 1."
                    .to_string(),
            );
        }

        // --- Pinned certificate ---
        if let Some(cert) = &self.tls.pinned_cert
            && !std::path::Path::new(cert).exists()
        {
            issues.push(format!(
                "ERROR: tls.pinned_cert '{}' does not exist.",
                cert
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_listen_backlog() -> i32 {
    5
}
fn default_max_ice_candidates() -> u32 {
    3
}
fn default_max_sdp_fragments() -> u32 {
    2
}
fn default_true() -> bool {
    true
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: DirectConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.session.max_reconnect_attempts, 5);
        assert_eq!(config.session.reconnect_delay_ms, 1000);
        assert!(config.session.reconnect);
        assert_eq!(config.session.listen_backlog, 5);
        assert_eq!(config.session.max_ice_candidates, 3);
        assert_eq!(config.session.max_sdp_fragments, 2);
        assert!(!config.session.counting_exchange);
        assert!(config.tls.pinned_cert.is_none());
        assert_eq!(config.ice.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_only_session_section() {
        let toml_str = r#"
[session]
reconnect_delay_ms = 250
counting_exchange = true
"#;
        let config: DirectConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");

        assert_eq!(config.session.reconnect_delay_ms, 250);
        assert!(config.session.counting_exchange);
        // Remaining fields use defaults
        assert_eq!(config.session.max_reconnect_attempts, 5);
        assert_eq!(config.session.listen_backlog, 5);
        assert_eq!(config.ice.stun_urls.len(), 1);
    }

    #[test]
    fn zero_delay_is_an_error() {
        let mut config = DirectConfig::default();
        config.session.reconnect_delay_ms = 0;
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("ERROR:"));
        assert!(issues[0].contains("reconnect_delay_ms"));
    }

    #[test]
    fn zero_backlog_is_an_error() {
        let mut config = DirectConfig::default();
        config.session.listen_backlog = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("listen_backlog")));
    }

    #[test]
    fn excessive_attempts_only_warn() {
        let mut config = DirectConfig::default();
        config.session.max_reconnect_attempts = 1000;
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("WARNING:"));
    }

    #[test]
    fn missing_pinned_cert_is_an_error() {
        let mut config = DirectConfig::default();
        config.tls.pinned_cert = Some("/nonexistent/direct-pinned.pem".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("pinned_cert")));
    }

    #[test]
    fn bad_stun_url_is_an_error() {
        let toml_str = r#"
[ice]
stun_urls = ["turn:relay.example.com:3478"]
"#;
        let config: DirectConfig = toml::from_str(toml_str).unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues[0].contains("turn:relay.example.com:3478"));
    }
}
