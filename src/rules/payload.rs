/// Token replaced by a CR LF pair.
pub const CRLF_TOKEN: &str = "[crlf]";
/// Token replaced by the host part of the server address.
pub const HOST_TOKEN: &str = "[host]";
/// Token replaced by the full `host:port` server address.
pub const HOST_PORT_TOKEN: &str = "[host_port]";

/// A payload template as written by the operator, e.g.
/// `CONNECT [host_port] HTTP/1.1[crlf]Host: [host][crlf][crlf]`.
///
/// Templates are kept in their raw form and expanded on every rewrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadTemplate {
    raw: String,
}

impl PayloadTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// An empty template disables the rule it is attached to.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Expand the template into the literal bytes put on the wire.
    ///
    /// `[crlf]` is always expanded. `[host]` and `[host_port]` are only
    /// expanded when `server_addr` is a `host:port` pair; otherwise they
    /// are left verbatim.
    pub fn expand(&self, server_addr: &str) -> Vec<u8> {
        let mut out = self.raw.replace(CRLF_TOKEN, "\r\n");

        if let Some((host, port)) = split_host_port(server_addr) {
            out = out.replace(HOST_PORT_TOKEN, &format!("{}:{}", host, port));
            out = out.replace(HOST_TOKEN, host);
        }

        out.into_bytes()
    }
}

impl From<&str> for PayloadTemplate {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for PayloadTemplate {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Split `host:port` on the last colon. Bracketed IPv6 hosts keep their
/// brackets so that `[host_port]` stays dialable.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    if addr.is_empty() {
        return None;
    }
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crlf_expansion() {
        let template = PayloadTemplate::new("[crlf]custom[crlf]");
        assert_eq!(template.expand(""), b"\r\ncustom\r\n");
    }

    #[test]
    fn test_host_templating() {
        let template = PayloadTemplate::new("[host]:[host_port]");
        assert_eq!(
            template.expand("example.com:443"),
            b"example.com:example.com:443"
        );
    }

    #[test]
    fn test_full_connect_payload() {
        let template =
            PayloadTemplate::new("CONNECT [host_port] HTTP/1.1[crlf]Host: [host][crlf][crlf]");
        assert_eq!(
            template.expand("proxy.local:8080"),
            b"CONNECT proxy.local:8080 HTTP/1.1\r\nHost: proxy.local\r\n\r\n"
        );
    }

    #[test]
    fn test_host_tokens_kept_without_server() {
        let template = PayloadTemplate::new("GET / HTTP/1.1[crlf]Host: [host][crlf]");
        assert_eq!(template.expand(""), b"GET / HTTP/1.1\r\nHost: [host]\r\n");
        assert_eq!(
            template.expand("no-port"),
            b"GET / HTTP/1.1\r\nHost: [host]\r\n"
        );
    }

    #[test]
    fn test_literal_template() {
        let template = PayloadTemplate::new("HTTP/1.1 200 Connection Established");
        assert_eq!(
            template.expand("example.com:443"),
            b"HTTP/1.1 200 Connection Established"
        );
        assert!(!template.is_empty());
        assert!(PayloadTemplate::default().is_empty());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("a.b:80"), Some(("a.b", "80")));
        assert_eq!(split_host_port("[::1]:443"), Some(("[::1]", "443")));
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("host:"), None);
        assert_eq!(split_host_port(""), None);
    }
}
