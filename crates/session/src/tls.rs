use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{info, warn};

use crate::error::{SessionError, SetupStage};

/// Client TLS setup for `https://` targets.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM certificate trusted on top of the platform roots.
    pub pinned_cert: Option<String>,
}

/// Client connector trusting the platform roots plus `pinned_cert`. Uses
/// the ring provider directly, so no process-wide provider is needed.
pub fn build_tls_connector(pinned_cert: Option<&str>) -> Result<TlsConnector, rustls::Error> {
    let mut root_store = rustls::RootCertStore::empty();

    // Platform roots as baseline
    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Could not load platform cert: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = pinned_cert {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                let certs: Vec<_> = rustls_pemfile::certs(&mut pem_data.as_slice())
                    .filter_map(|r| r.ok())
                    .collect();
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned server certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read TLS cert from {cert_path}: {e}, falling back to system roots");
            }
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Run the client handshake over an already connected stream.
pub async fn secure_handshake(
    stream: TcpStream,
    host: &str,
    options: &TlsOptions,
) -> Result<TlsStream<TcpStream>, SessionError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| SessionError::ServerName(host.to_string()))?;
    let connector = build_tls_connector(options.pinned_cert.as_deref())
        .map_err(|e| SessionError::setup(SetupStage::Tls, io::Error::other(e)))?;
    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| SessionError::setup(SetupStage::Tls, e))?;
    info!(host, "TLS handshake complete");
    Ok(stream)
}
