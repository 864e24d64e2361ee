use std::io;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// Control over send coalescing (Nagle's algorithm) on a socket.
pub trait NoDelay {
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;
}

impl NoDelay for TcpStream {
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

/// A byte stream a relay session can own as its local or remote side.
///
/// Endpoints backed by a socket expose [`NoDelay`]; anything else keeps the
/// default and Nagle settings are skipped for it.
pub trait Endpoint: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn no_delay(&self) -> Option<&dyn NoDelay> {
        None
    }
}

pub type BoxedEndpoint = Box<dyn Endpoint>;

impl Endpoint for TcpStream {
    fn no_delay(&self) -> Option<&dyn NoDelay> {
        Some(self)
    }
}

impl<IO: Endpoint> Endpoint for tokio_rustls::client::TlsStream<IO> {
    fn no_delay(&self) -> Option<&dyn NoDelay> {
        self.get_ref().0.no_delay()
    }
}

impl Endpoint for DuplexStream {}

/// Turn off Nagle on an endpoint if it supports it. Returns whether the
/// endpoint had the capability at all.
pub fn disable_nagle(endpoint: &dyn Endpoint) -> io::Result<bool> {
    match endpoint.no_delay() {
        Some(socket) => socket.set_nodelay(true).map(|_| true),
        None => Ok(false),
    }
}
