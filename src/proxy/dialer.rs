use super::endpoint::BoxedEndpoint;
use super::tls::TlsConnector;
use super::RelayError;
use crate::rules::split_host_port;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Where a session's remote side connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    /// Plain TCP to the resolved remote address.
    Plain(SocketAddr),
    /// TLS to `host:port`; the session only ever sees plaintext.
    TlsUnwrap(String),
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteTarget::Plain(addr) => write!(f, "{}", addr),
            RemoteTarget::TlsUnwrap(target) => write!(f, "tls://{}", target),
        }
    }
}

/// Opens the single remote connection of a session. No retries.
pub struct RemoteDialer {
    target: RemoteTarget,
    tls: Option<Arc<TlsConnector>>,
}

impl RemoteDialer {
    pub fn new(target: RemoteTarget) -> Self {
        Self { target, tls: None }
    }

    /// Use a shared connector instead of building one per dial.
    pub fn with_tls_connector(mut self, connector: Arc<TlsConnector>) -> Self {
        self.tls = Some(connector);
        self
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    pub async fn dial(&self) -> Result<BoxedEndpoint, RelayError> {
        match &self.target {
            RemoteTarget::Plain(addr) => {
                let stream = TcpStream::connect(addr).await?;
                Ok(Box::new(stream))
            }
            RemoteTarget::TlsUnwrap(target) => {
                let (host, _) = split_host_port(target)
                    .ok_or_else(|| RelayError::InvalidAddress(target.clone()))?;

                let connector = match &self.tls {
                    Some(connector) => Arc::clone(connector),
                    None => Arc::new(TlsConnector::new(&[])?),
                };

                let stream = TcpStream::connect(target.as_str()).await?;
                let tls_stream = connector.connect(host, stream).await?;
                Ok(Box::new(tls_stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = RemoteDialer::new(RemoteTarget::Plain(addr));
        let mut remote = dialer.dial().await.unwrap();
        assert!(remote.no_delay().is_some());
        remote.write_all(b"ping").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_plain_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = RemoteDialer::new(RemoteTarget::Plain(addr));
        assert!(matches!(dialer.dial().await, Err(RelayError::IoError(_))));
    }

    #[tokio::test]
    async fn test_tls_dial_requires_port() {
        let dialer = RemoteDialer::new(RemoteTarget::TlsUnwrap("example.com".to_string()));
        assert!(matches!(
            dialer.dial().await,
            Err(RelayError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_tls_dial_handshake_failure() {
        // A plaintext server that hangs up immediately.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let dialer = RemoteDialer::new(RemoteTarget::TlsUnwrap(addr.to_string()));
        assert!(matches!(dialer.dial().await, Err(RelayError::TlsError(_))));
    }

    #[test]
    fn test_target_display() {
        let plain = RemoteTarget::Plain("127.0.0.1:80".parse().unwrap());
        assert_eq!(plain.to_string(), "127.0.0.1:80");
        let tls = RemoteTarget::TlsUnwrap("example.com:443".to_string());
        assert_eq!(tls.to_string(), "tls://example.com:443");
    }
}
