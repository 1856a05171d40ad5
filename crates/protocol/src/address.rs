use std::fmt;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3456;
pub const HTTPS_PORT: u16 = 443;
pub const HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Where the caller connects to (or, for the callee, which port to listen on).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    /// Set when the address was given as a URL rather than `host:port`.
    pub scheme: Option<Scheme>,
}

impl PeerAddress {
    /// Parse `host:port`, `:port`, `http://host[:port][/path]` or
    /// `https://host[:port][/path]`. Paths and query strings are discarded.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let (scheme, rest) = if let Some(rest) = input.strip_prefix("https://") {
            (Some(Scheme::Https), rest)
        } else if let Some(rest) = input.strip_prefix("http://") {
            (Some(Scheme::Http), rest)
        } else {
            (None, input)
        };

        let Some(scheme) = scheme else {
            let (host, port) = parse_ip_and_port(rest)?;
            return Ok(Self {
                host,
                port,
                scheme: None,
            });
        };

        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(AddressError::MissingHost(input.to_string()));
        }
        let (host, port) = if authority.contains(':') {
            parse_ip_and_port(authority)?
        } else {
            let port = match scheme {
                Scheme::Https => HTTPS_PORT,
                Scheme::Http => HTTP_PORT,
            };
            (authority.to_string(), port)
        };
        Ok(Self {
            host,
            port,
            scheme: Some(scheme),
        })
    }

    pub fn is_url(&self) -> bool {
        self.scheme.is_some()
    }

    /// Only `https://` targets on port 443 get the secure stream adapter.
    pub fn is_secure(&self) -> bool {
        self.scheme == Some(Scheme::Https) && self.port == HTTPS_PORT
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Some(Scheme::Https) => write!(f, "https://{}:{}", self.host, self.port),
            Some(Scheme::Http) => write!(f, "http://{}:{}", self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Split an `ip:port` string. An empty host means [`DEFAULT_HOST`], an empty
/// port means [`DEFAULT_PORT`].
pub fn parse_ip_and_port(input: &str) -> Result<(String, u16), AddressError> {
    let (host, port_str) = input
        .rsplit_once(':')
        .ok_or_else(|| AddressError::MissingColon(input.to_string()))?;

    let host = if host.is_empty() {
        DEFAULT_HOST.to_string()
    } else {
        host.to_string()
    };

    if port_str.is_empty() {
        return Ok((host, DEFAULT_PORT));
    }
    if !port_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::InvalidPort(port_str.to_string()));
    }
    let port: u64 = port_str
        .parse()
        .map_err(|_| AddressError::PortOutOfRange(port_str.to_string()))?;
    let port = u16::try_from(port).map_err(|_| AddressError::PortOutOfRange(port_str.to_string()))?;
    Ok((host, port))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address '{0}' is not in ip:port form")]
    MissingColon(String),
    #[error("address '{0}' has no host")]
    MissingHost(String),
    #[error("invalid port number: {0}")]
    InvalidPort(String),
    #[error("port out of range (0-65535): {0}")]
    PortOutOfRange(String),
}
