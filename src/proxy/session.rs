use super::dialer::{RemoteDialer, RemoteTarget};
use super::endpoint::{disable_nagle, BoxedEndpoint, Endpoint};
use super::tls::TlsConnector;
use crate::logger::{ByteDump, Logger, NullLogger};
use crate::rules::{
    BufferContext, Direction, FilterMode, Intercepted, Interceptor, PayloadTemplate, Rewrite,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Size of the read buffer of each pipe.
pub const PIPE_BUFFER_SIZE: usize = 0xffff;

type EndpointReader = ReadHalf<BoxedEndpoint>;
type EndpointWriter = WriteHalf<BoxedEndpoint>;

/// Single-fire termination signal shared by the pipes of one session.
///
/// Only the first caller of [`Termination::fire`] wins; later callers return
/// immediately without blocking.
#[derive(Debug, Default)]
pub struct Termination {
    terminated: AtomicBool,
    token: CancellationToken,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the one caller that actually terminated the session.
    pub fn fire(&self) -> bool {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }
}

/// Byte counts reported when a session closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// local → remote
    pub sent_bytes: u64,
    /// remote → local
    pub received_bytes: u64,
}

/// State shared read-only between a session and its pipe tasks, apart from
/// the counters and the termination flag.
struct Shared {
    rules: Interceptor,
    log: Arc<dyn Logger>,
    hex_output: bool,
    termination: Termination,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
}

impl Shared {
    fn count(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::Outbound => &self.sent_bytes,
            Direction::Inbound => &self.received_bytes,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
        }
    }

    /// Report a pipe failure. End-of-stream terminates quietly.
    fn fail(&self, what: &str, err: Option<io::Error>) {
        if !self.termination.fire() {
            return;
        }
        match err {
            Some(e) if e.kind() != io::ErrorKind::UnexpectedEof => {
                self.log.warn(format_args!("{} '{}'", what, e));
            }
            _ => self.log.debug(format_args!("{}: end of stream", what)),
        }
    }

    fn log_rewrite(&self, out: &Intercepted<'_>) {
        match out.rewrite {
            Some(Rewrite::WebSocketUpgrade) => {
                self.log.info(format_args!("Upgrade connection to WebSocket"));
            }
            Some(Rewrite::Connect) => {
                self.log.info(format_args!(
                    "Injected outbound payload: {}",
                    String::from_utf8_lossy(&out.data)
                ));
            }
            Some(Rewrite::HttpResponse) => {
                self.log.info(format_args!(
                    "Injected incoming payload: {}",
                    String::from_utf8_lossy(&out.data)
                ));
            }
            None => {}
        }
    }
}

/// Local write half handed to the outbound pipe in reverse-proxy mode. The
/// pipe answers the upgrade on it, then passes it back to the session so
/// the remote → local pipe can be opened.
struct PendingUpgrade {
    local: EndpointWriter,
    opened: mpsc::Sender<EndpointWriter>,
}

/// Which pipes are running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Piping {
    OutboundOnly,
    Both,
}

/// Relays one accepted local connection to the remote side.
///
/// Takes over the local endpoint and closes it, together with the remote
/// endpoint, when [`RelaySession::start`] returns.
pub struct RelaySession {
    local: BoxedEndpoint,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    dialer: RemoteDialer,
    rules: Interceptor,
    reverse_proxy: bool,
    nagle: bool,
    hex_output: bool,
    log: Arc<dyn Logger>,
}

impl RelaySession {
    pub fn new<E: Endpoint>(
        local: E,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        server_addr: impl Into<String>,
    ) -> Self {
        Self::with_target(
            Box::new(local),
            local_addr,
            remote_addr,
            server_addr.into(),
            RemoteTarget::Plain(remote_addr),
        )
    }

    /// Session whose remote side is TLS, exposed unencrypted to the local side.
    pub fn new_tls_unwrapped<E: Endpoint>(
        local: E,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        server_addr: impl Into<String>,
        tls_dial_target: impl Into<String>,
    ) -> Self {
        Self::with_target(
            Box::new(local),
            local_addr,
            remote_addr,
            server_addr.into(),
            RemoteTarget::TlsUnwrap(tls_dial_target.into()),
        )
    }

    fn with_target(
        local: BoxedEndpoint,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        server_addr: String,
        target: RemoteTarget,
    ) -> Self {
        Self {
            local,
            local_addr,
            remote_addr,
            dialer: RemoteDialer::new(target),
            rules: Interceptor::new(server_addr),
            reverse_proxy: false,
            nagle: true,
            hex_output: false,
            log: Arc::new(NullLogger),
        }
    }

    pub fn set_outbound_payload(&mut self, template: impl Into<PayloadTemplate>) -> &mut Self {
        self.rules.outbound = template.into();
        self
    }

    pub fn set_incoming_payload(&mut self, template: impl Into<PayloadTemplate>) -> &mut Self {
        self.rules.incoming = template.into();
        self
    }

    pub fn set_reverse_proxy(&mut self, enabled: bool) -> &mut Self {
        self.reverse_proxy = enabled;
        self
    }

    pub fn set_max_outbound_filter_bytes(&mut self, size: usize) -> &mut Self {
        self.rules.max_outbound_filter_bytes = size;
        self
    }

    pub fn set_max_inbound_filter_bytes(&mut self, size: usize) -> &mut Self {
        self.rules.max_inbound_filter_bytes = size;
        self
    }

    pub fn set_filter_mode(&mut self, mode: FilterMode) -> &mut Self {
        self.rules.filter_mode = mode;
        self
    }

    /// `false` disables send coalescing on both endpoints.
    pub fn set_nagle(&mut self, enabled: bool) -> &mut Self {
        self.nagle = enabled;
        self
    }

    pub fn set_hex_output(&mut self, enabled: bool) -> &mut Self {
        self.hex_output = enabled;
        self
    }

    pub fn set_logger(&mut self, log: Arc<dyn Logger>) -> &mut Self {
        self.log = log;
        self
    }

    pub fn set_tls_connector(&mut self, connector: Arc<TlsConnector>) -> &mut Self {
        let target = self.dialer.target().clone();
        self.dialer = RemoteDialer::new(target).with_tls_connector(connector);
        self
    }

    /// Connect to the remote and relay until either side fails or closes.
    ///
    /// Returns `None` when the remote could not be reached.
    pub async fn start(self) -> Option<SessionStats> {
        let RelaySession {
            local,
            local_addr,
            remote_addr,
            dialer,
            rules,
            reverse_proxy,
            nagle,
            hex_output,
            log,
        } = self;

        let remote = match dialer.dial().await {
            Ok(remote) => remote,
            Err(e) => {
                log.warn(format_args!("Remote connection failed: {}", e));
                return None;
            }
        };

        if !nagle {
            for endpoint in [&local, &remote] {
                if let Err(e) = disable_nagle(&**endpoint) {
                    log.debug(format_args!("Failed to disable Nagle: {}", e));
                }
            }
        }

        log.info(format_args!("Opened {} >>> {}", local_addr, remote_addr));

        let shared = Arc::new(Shared {
            rules,
            log,
            hex_output,
            termination: Termination::new(),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
        });

        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let mut tasks = JoinSet::new();
        let (opened_tx, mut opened_rx) = mpsc::channel(1);
        let mut pending_inbound = None;

        let mut piping = if reverse_proxy {
            let upgrade = PendingUpgrade {
                local: local_write,
                opened: opened_tx,
            };
            tasks.spawn(
                pipe(Arc::clone(&shared), Direction::Outbound, local_read, remote_write, Some(upgrade))
                    .in_current_span(),
            );
            pending_inbound = Some(remote_read);
            Piping::OutboundOnly
        } else {
            drop(opened_tx);
            tasks.spawn(
                pipe(Arc::clone(&shared), Direction::Outbound, local_read, remote_write, None)
                    .in_current_span(),
            );
            tasks.spawn(
                pipe(Arc::clone(&shared), Direction::Inbound, remote_read, local_write, None)
                    .in_current_span(),
            );
            Piping::Both
        };

        loop {
            tokio::select! {
                _ = shared.termination.wait() => break,
                Some(local_write) = opened_rx.recv(), if piping == Piping::OutboundOnly => {
                    if let Some(remote_read) = pending_inbound.take() {
                        shared.log.debug(format_args!("Protocol switched, opening remote pipe"));
                        tasks.spawn(
                            pipe(Arc::clone(&shared), Direction::Inbound, remote_read, local_write, None)
                                .in_current_span(),
                        );
                    }
                    piping = Piping::Both;
                }
            }
        }

        // Aborting the pipes drops their halves, which closes both endpoints.
        tasks.shutdown().await;
        drop(pending_inbound);

        let stats = shared.stats();
        shared.log.info(format_args!(
            "Closed ({} bytes sent, {} bytes received)",
            stats.sent_bytes, stats.received_bytes
        ));
        Some(stats)
    }
}

/// Copy one direction: read, intercept, write, count. Stops on the first
/// error or end-of-stream and fires the session's termination.
async fn pipe(
    shared: Arc<Shared>,
    direction: Direction,
    mut src: EndpointReader,
    mut dst: EndpointWriter,
    mut upgrade: Option<PendingUpgrade>,
) {
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut first = true;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => return shared.fail("Read failed", None),
            Ok(n) => n,
            Err(e) => return shared.fail("Read failed", Some(e)),
        };

        let ctx = BufferContext {
            first,
            awaiting_upgrade: upgrade.is_some(),
        };
        let out = shared.rules.intercept(direction, &buf[..n], ctx);
        shared.log_rewrite(&out);

        match direction {
            Direction::Outbound => shared.log.debug(format_args!(">>> {} bytes sent", n)),
            Direction::Inbound => shared.log.debug(format_args!("<<< {} bytes received", n)),
        }
        shared
            .log
            .trace(format_args!("{}", ByteDump::new(&out.data, shared.hex_output)));

        let written = match upgrade.take() {
            Some(pending) if out.switch_protocols => {
                // The reply goes back to the client, never to the remote.
                reply_and_switch(pending, &out.data)
                    .await
                    .map(|_| Direction::Inbound)
            }
            other => {
                upgrade = other;
                write_buffer(&mut dst, &out.data).await.map(|_| direction)
            }
        };

        match written {
            Ok(counted) => shared.count(counted, out.data.len()),
            Err(e) => return shared.fail("Write failed", Some(e)),
        }
        first = false;
    }
}

async fn write_buffer(dst: &mut EndpointWriter, data: &[u8]) -> io::Result<()> {
    dst.write_all(data).await?;
    dst.flush().await
}

async fn reply_and_switch(mut pending: PendingUpgrade, data: &[u8]) -> io::Result<()> {
    write_buffer(&mut pending.local, data).await?;
    // The session is gone only if it already terminated.
    let _ = pending.opened.send(pending.local).await;
    Ok(())
}
