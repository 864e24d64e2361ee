mod dialer;
mod endpoint;
mod session;
mod tls;

pub use dialer::{RemoteDialer, RemoteTarget};
pub use endpoint::{disable_nagle, BoxedEndpoint, Endpoint, NoDelay};
pub use session::{RelaySession, SessionStats, Termination, PIPE_BUFFER_SIZE};
pub use tls::TlsConnector;

use crate::config::{Config, ConfigError};
use crate::logger::TracingLogger;
use crate::rules::{Interceptor, PayloadTemplate};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    TlsError(String),
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
}

/// Immutable settings every session of a server is built from
#[derive(Clone)]
pub struct RelaySettings {
    pub listen_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// `host:port` dialed over TLS; `None` relays plain TCP
    pub tls_target: Option<String>,
    pub tls_connector: Option<Arc<TlsConnector>>,
    pub rules: Interceptor,
    pub reverse_proxy: bool,
    pub nagle: bool,
    pub hex_output: bool,
}

impl RelaySettings {
    /// Plain relay from `listen_addr` to `remote_addr` with no rewriting
    pub fn new(listen_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            remote_addr,
            tls_target: None,
            tls_connector: None,
            rules: Interceptor::default(),
            reverse_proxy: false,
            nagle: true,
            hex_output: false,
        }
    }

    /// Validate the config and resolve its addresses
    pub async fn from_config(config: &Config) -> Result<Self, RelayError> {
        config.validate()?;

        let listen_addr = resolve(&config.listen_addr()).await?;
        let remote_addr = resolve(&config.relay.remote).await?;

        let (tls_target, tls_connector) = if config.relay.unwrap_tls {
            let extra_roots = match &config.relay.ca_cert {
                Some(path) => crate::config::load_ca_certs(path)?,
                None => Vec::new(),
            };
            (
                Some(config.tls_dial_target().to_string()),
                Some(Arc::new(TlsConnector::new(&extra_roots)?)),
            )
        } else {
            (None, None)
        };

        let payload = &config.payload;
        let rules = Interceptor {
            server_addr: config.relay.server.clone().unwrap_or_default(),
            outbound: PayloadTemplate::new(payload.outbound.as_str()),
            incoming: PayloadTemplate::new(payload.incoming.as_str()),
            max_outbound_filter_bytes: payload.max_outbound_filter_bytes,
            max_inbound_filter_bytes: payload.max_inbound_filter_bytes,
            filter_mode: payload.filter_mode,
        };

        Ok(Self {
            listen_addr,
            remote_addr,
            tls_target,
            tls_connector,
            rules,
            reverse_proxy: config.relay.reverse_proxy,
            nagle: config.relay.nagle,
            hex_output: config.logging.hex,
        })
    }

    /// Build the session for one accepted connection
    pub fn session(&self, stream: TcpStream, peer_addr: SocketAddr) -> RelaySession {
        let server_addr = self.rules.server_addr.clone();
        let mut session = match &self.tls_target {
            Some(target) => {
                let mut session = RelaySession::new_tls_unwrapped(
                    stream,
                    peer_addr,
                    self.remote_addr,
                    server_addr,
                    target.clone(),
                );
                if let Some(connector) = &self.tls_connector {
                    session.set_tls_connector(Arc::clone(connector));
                }
                session
            }
            None => RelaySession::new(stream, peer_addr, self.remote_addr, server_addr),
        };

        session
            .set_outbound_payload(self.rules.outbound.clone())
            .set_incoming_payload(self.rules.incoming.clone())
            .set_max_outbound_filter_bytes(self.rules.max_outbound_filter_bytes)
            .set_max_inbound_filter_bytes(self.rules.max_inbound_filter_bytes)
            .set_filter_mode(self.rules.filter_mode)
            .set_reverse_proxy(self.reverse_proxy)
            .set_nagle(self.nagle)
            .set_hex_output(self.hex_output)
            .set_logger(Arc::new(TracingLogger));
        session
    }
}

/// Resolve `host:port` to the first socket address it names
pub async fn resolve(addr: &str) -> Result<SocketAddr, RelayError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| RelayError::InvalidAddress(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| RelayError::InvalidAddress(addr.to_string()))
}

/// TCP relay server: one session per accepted connection
pub struct RelayServer {
    settings: Arc<RelaySettings>,
    next_id: AtomicU64,
}

impl RelayServer {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings: Arc::new(settings),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> Arc<RelaySettings> {
        Arc::clone(&self.settings)
    }

    /// Bind the listen address
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        Ok(TcpListener::bind(self.settings.listen_addr).await?)
    }

    /// Start the relay server
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), RelayError> {
        let listener = self.bind().await?;
        self.serve(listener, cancel_token).await
    }

    /// Accept connections on `listener` until cancelled
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> Result<(), RelayError> {
        info!(
            "Relaying from {} to {}",
            listener.local_addr()?,
            self.settings.remote_addr
        );
        if let Some(target) = &self.settings.tls_target {
            info!("Unwrapping TLS from {}", target);
        }

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Relay server shutting down...");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                            let session = self.settings.session(stream, peer_addr);
                            let token = cancel_token.clone();
                            let span = info_span!("conn", id);
                            tokio::spawn(
                                async move {
                                    debug!("Accepted connection from {}", peer_addr);
                                    tokio::select! {
                                        _ = token.cancelled() => {}
                                        _ = session.start() => {}
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            warn!("Failed to accept connection '{}'", e);
                        }
                    }
                }
            }
        }

        info!("Relay server stopped");
        Ok(())
    }
}
