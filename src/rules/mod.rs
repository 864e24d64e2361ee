mod payload;

pub use payload::{split_host_port, PayloadTemplate};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Exact reply sent to the client when the relay answers a WebSocket upgrade.
pub const SWITCHING_PROTOCOLS: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n";

const UPGRADE_WEBSOCKET: &[u8] = b"upgrade: websocket";
const CONNECT_MARKER: &[u8] = b"CONNECT ";
const HTTP1_MARKER: &[u8] = b"HTTP/1.";

/// Default size above which buffers are never rewritten.
pub const DEFAULT_MAX_FILTER_BYTES: usize = 1024;

/// Which way a buffer is travelling through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// local → remote
    Outbound,
    /// remote → local
    Inbound,
}

/// Decides which buffers are candidates for payload rewriting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterMode {
    /// Every buffer no larger than the direction's size cap.
    #[default]
    SizeThreshold,
    /// Only the first buffer read in each direction.
    FirstBuffer,
}

/// Where a buffer sits in its pipe when it is intercepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferContext {
    /// No buffer has been written by this pipe yet.
    pub first: bool,
    /// Reverse-proxy mode is on and the protocol switch has not happened.
    pub awaiting_upgrade: bool,
}

/// Which rule produced an [`Intercepted`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    WebSocketUpgrade,
    Connect,
    HttpResponse,
}

/// Outcome of running one buffer through the [`Interceptor`].
#[derive(Debug)]
pub struct Intercepted<'a> {
    pub data: Cow<'a, [u8]>,
    /// The buffer is a reply for the local side and the deferred
    /// remote → local pipe must be opened.
    pub switch_protocols: bool,
    pub rewrite: Option<Rewrite>,
}

impl<'a> Intercepted<'a> {
    fn pass(buf: &'a [u8]) -> Self {
        Self {
            data: Cow::Borrowed(buf),
            switch_protocols: false,
            rewrite: None,
        }
    }

    fn replaced(data: Vec<u8>, rewrite: Rewrite) -> Self {
        Self {
            data: Cow::Owned(data),
            switch_protocols: rewrite == Rewrite::WebSocketUpgrade,
            rewrite: Some(rewrite),
        }
    }
}

/// Rewrite rules applied to every buffer before it is forwarded.
///
/// Matching is plain byte-substring search; the HTTP shapes are recognised,
/// never parsed.
#[derive(Debug, Clone)]
pub struct Interceptor {
    pub server_addr: String,
    pub outbound: PayloadTemplate,
    pub incoming: PayloadTemplate,
    pub max_outbound_filter_bytes: usize,
    pub max_inbound_filter_bytes: usize,
    pub filter_mode: FilterMode,
}

impl Default for Interceptor {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            outbound: PayloadTemplate::default(),
            incoming: PayloadTemplate::default(),
            max_outbound_filter_bytes: DEFAULT_MAX_FILTER_BYTES,
            max_inbound_filter_bytes: DEFAULT_MAX_FILTER_BYTES,
            filter_mode: FilterMode::default(),
        }
    }
}

impl Interceptor {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    pub fn intercept<'a>(
        &self,
        direction: Direction,
        buf: &'a [u8],
        ctx: BufferContext,
    ) -> Intercepted<'a> {
        match direction {
            Direction::Outbound => self.intercept_outbound(buf, ctx),
            Direction::Inbound => self.intercept_inbound(buf, ctx),
        }
    }

    fn intercept_outbound<'a>(&self, buf: &'a [u8], ctx: BufferContext) -> Intercepted<'a> {
        if ctx.awaiting_upgrade && contains_ignore_ascii_case(buf, UPGRADE_WEBSOCKET) {
            return Intercepted::replaced(SWITCHING_PROTOCOLS.to_vec(), Rewrite::WebSocketUpgrade);
        }

        if self.outbound.is_empty()
            || !self.filter_applies(buf.len(), self.max_outbound_filter_bytes, ctx)
        {
            return Intercepted::pass(buf);
        }

        if contains(buf, CONNECT_MARKER) {
            return Intercepted::replaced(self.outbound.expand(&self.server_addr), Rewrite::Connect);
        }

        Intercepted::pass(buf)
    }

    fn intercept_inbound<'a>(&self, buf: &'a [u8], ctx: BufferContext) -> Intercepted<'a> {
        if self.incoming.is_empty()
            || !self.filter_applies(buf.len(), self.max_inbound_filter_bytes, ctx)
        {
            return Intercepted::pass(buf);
        }

        if contains(buf, HTTP1_MARKER) {
            return Intercepted::replaced(self.incoming.expand(""), Rewrite::HttpResponse);
        }

        Intercepted::pass(buf)
    }

    fn filter_applies(&self, len: usize, max: usize, ctx: BufferContext) -> bool {
        match self.filter_mode {
            FilterMode::SizeThreshold => len <= max,
            FilterMode::FirstBuffer => ctx.first,
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.len() >= needle.len()
        && haystack
            .windows(needle.len())
            .any(|w| w.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECT_REQ: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
    const UPGRADE_REQ: &[u8] =
        b"GET /ws HTTP/1.1\r\nHost: a\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\n\r\n";

    fn outbound_rules(template: &str) -> Interceptor {
        Interceptor {
            outbound: PayloadTemplate::new(template),
            ..Interceptor::default()
        }
    }

    fn reverse() -> BufferContext {
        BufferContext {
            first: true,
            awaiting_upgrade: true,
        }
    }

    #[test]
    fn test_passthrough_without_templates() {
        let rules = Interceptor::default();
        for buf in [
            CONNECT_REQ,
            b"HTTP/1.1 403 Forbidden\r\n\r\n".as_slice(),
            b"\x00\xff".as_slice(),
        ] {
            let out = rules.intercept(Direction::Outbound, buf, BufferContext::default());
            assert_eq!(out.data.as_ref(), buf);
            assert!(matches!(out.data, Cow::Borrowed(_)));
            let out = rules.intercept(Direction::Inbound, buf, BufferContext::default());
            assert_eq!(out.data.as_ref(), buf);
            assert!(out.rewrite.is_none());
        }
    }

    #[test]
    fn test_connect_rewrite() {
        let rules = outbound_rules("[crlf]custom[crlf]");
        let out = rules.intercept(Direction::Outbound, CONNECT_REQ, BufferContext::default());
        assert_eq!(out.data.as_ref(), b"\r\ncustom\r\n");
        assert_eq!(out.rewrite, Some(Rewrite::Connect));
        assert!(!out.switch_protocols);
    }

    #[test]
    fn test_connect_rewrite_uses_server_addr() {
        let mut rules = outbound_rules("CONNECT [host_port] HTTP/1.1[crlf][crlf]");
        rules.server_addr = "tunnel.example:8443".to_string();
        let out = rules.intercept(Direction::Outbound, CONNECT_REQ, BufferContext::default());
        assert_eq!(
            out.data.as_ref(),
            b"CONNECT tunnel.example:8443 HTTP/1.1\r\n\r\n"
        );
    }

    #[test]
    fn test_connect_rewrite_skips_oversized_buffer() {
        let mut rules = outbound_rules("[crlf]custom[crlf]");
        rules.max_outbound_filter_bytes = 16;
        let out = rules.intercept(Direction::Outbound, CONNECT_REQ, BufferContext::default());
        assert_eq!(out.data.as_ref(), CONNECT_REQ);
        assert!(out.rewrite.is_none());

        rules.max_outbound_filter_bytes = CONNECT_REQ.len();
        let out = rules.intercept(Direction::Outbound, CONNECT_REQ, BufferContext::default());
        assert_eq!(out.rewrite, Some(Rewrite::Connect));
    }

    #[test]
    fn test_connect_marker_is_case_sensitive() {
        let rules = outbound_rules("x");
        let buf = b"connect example.com:443 HTTP/1.1\r\n\r\n";
        let out = rules.intercept(Direction::Outbound, buf, BufferContext::default());
        assert_eq!(out.data.as_ref(), buf);
    }

    #[test]
    fn test_http_response_rewrite() {
        let rules = Interceptor {
            incoming: PayloadTemplate::new("HTTP/1.1 200 Connection Established[crlf][crlf]"),
            ..Interceptor::default()
        };
        let out = rules.intercept(
            Direction::Inbound,
            b"HTTP/1.0 403 Forbidden\r\nServer: squid\r\n\r\n",
            BufferContext::default(),
        );
        assert_eq!(
            out.data.as_ref(),
            b"HTTP/1.1 200 Connection Established\r\n\r\n"
        );
        assert_eq!(out.rewrite, Some(Rewrite::HttpResponse));

        // Host tokens are never expanded on the way in.
        let rules = Interceptor {
            server_addr: "example.com:443".to_string(),
            incoming: PayloadTemplate::new("[host]"),
            ..Interceptor::default()
        };
        let out = rules.intercept(Direction::Inbound, b"HTTP/1.1 200 OK", BufferContext::default());
        assert_eq!(out.data.as_ref(), b"[host]");
    }

    #[test]
    fn test_http_response_rewrite_skips_oversized_buffer() {
        let rules = Interceptor {
            incoming: PayloadTemplate::new("HTTP/1.1 200 OK"),
            max_inbound_filter_bytes: 4,
            ..Interceptor::default()
        };
        let buf = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
        let out = rules.intercept(Direction::Inbound, buf, BufferContext::default());
        assert_eq!(out.data.as_ref(), buf);
    }

    #[test]
    fn test_templates_do_not_cross_directions() {
        let rules = Interceptor {
            outbound: PayloadTemplate::new("out"),
            incoming: PayloadTemplate::new("in"),
            ..Interceptor::default()
        };
        let out = rules.intercept(Direction::Inbound, CONNECT_REQ, BufferContext::default());
        assert_eq!(out.data.as_ref(), b"in");
        let resp = b"HTTP/1.1 200 OK\r\n\r\n";
        let out = rules.intercept(Direction::Outbound, resp, BufferContext::default());
        assert_eq!(out.data.as_ref(), resp);
    }

    #[test]
    fn test_websocket_upgrade_short_circuit() {
        let rules = outbound_rules("[crlf]");
        let out = rules.intercept(Direction::Outbound, UPGRADE_REQ, reverse());
        assert_eq!(out.data.as_ref(), SWITCHING_PROTOCOLS);
        assert!(out.switch_protocols);
        assert_eq!(out.rewrite, Some(Rewrite::WebSocketUpgrade));
    }

    #[test]
    fn test_websocket_upgrade_ignores_size_cap() {
        let mut rules = Interceptor::default();
        rules.max_outbound_filter_bytes = 1;
        let out = rules.intercept(Direction::Outbound, UPGRADE_REQ, reverse());
        assert!(out.switch_protocols);
    }

    #[test]
    fn test_websocket_upgrade_requires_pending_switch() {
        let rules = Interceptor::default();
        let out = rules.intercept(Direction::Outbound, UPGRADE_REQ, BufferContext::default());
        assert_eq!(out.data.as_ref(), UPGRADE_REQ);
        assert!(!out.switch_protocols);

        let out = rules.intercept(Direction::Inbound, UPGRADE_REQ, reverse());
        assert!(!out.switch_protocols);
    }

    #[test]
    fn test_websocket_upgrade_wins_over_connect() {
        let rules = outbound_rules("nope");
        let buf = b"CONNECT a:1 HTTP/1.1\r\nupgrade: websocket\r\n\r\n";
        let out = rules.intercept(Direction::Outbound, buf, reverse());
        assert_eq!(out.data.as_ref(), SWITCHING_PROTOCOLS);
    }

    #[test]
    fn test_first_buffer_mode() {
        let mut rules = outbound_rules("[crlf]custom[crlf]");
        rules.filter_mode = FilterMode::FirstBuffer;
        rules.max_outbound_filter_bytes = 1;

        let first = BufferContext {
            first: true,
            awaiting_upgrade: false,
        };
        let out = rules.intercept(Direction::Outbound, CONNECT_REQ, first);
        assert_eq!(out.data.as_ref(), b"\r\ncustom\r\n");

        let later = BufferContext::default();
        let out = rules.intercept(Direction::Outbound, CONNECT_REQ, later);
        assert_eq!(out.data.as_ref(), CONNECT_REQ);
    }

    #[test]
    fn test_substring_helpers() {
        assert!(contains(b"xxCONNECT yy", b"CONNECT "));
        assert!(!contains(b"CONN", b"CONNECT "));
        assert!(contains_ignore_ascii_case(b"UPGRADE: WEBSOCKET", UPGRADE_WEBSOCKET));
        assert!(!contains_ignore_ascii_case(b"upgrade:websocket", UPGRADE_WEBSOCKET));
    }
}
