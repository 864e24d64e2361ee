use crate::proxy::RelayError;
use rustls::client::ClientConfig;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;

/// TLS connector used to unwrap the remote side of a relay
pub struct TlsConnector {
    inner: TokioTlsConnector,
}

impl TlsConnector {
    /// Create a connector trusting the Mozilla root set plus `extra_roots`
    pub fn new(extra_roots: &[CertificateDer<'static>]) -> Result<Self, RelayError> {
        let config = Self::create_client_config(extra_roots)?;
        Ok(Self::from_config(Arc::new(config)))
    }

    /// Wrap an existing client config
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            inner: TokioTlsConnector::from(config),
        }
    }

    /// Create TLS client config
    fn create_client_config(
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<ClientConfig, RelayError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        for cert in extra_roots {
            root_store
                .add(cert.clone())
                .map_err(|e| RelayError::TlsError(format!("Failed to add CA certificate: {}", e)))?;
        }

        Ok(ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    /// Perform the client handshake over `stream`, verifying the server as `host`
    pub async fn connect<IO>(
        &self,
        host: &str,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>, RelayError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(server_name_of(host).to_string())
            .map_err(|e| RelayError::InvalidServerName(format!("{}: {}", host, e)))?;

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| RelayError::TlsError(format!("TLS handshake failed: {}", e)))
    }
}

/// Strip IPv6 brackets so `[::1]` verifies as an IP address name.
fn server_name_of(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
