//! HTTP/1.1 plumbing shared by the dispatch frontends: request-head
//! parsing, Basic proxy auth, simple status responses and the bidirectional
//! tunnel relay.

use std::io;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Bound on reading the client's request head.
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// One parsed request head.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: String,
    /// Raw request-target: `host:port` for CONNECT, absolute-form or
    /// origin-form otherwise.
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    /// Bytes the head reader consumed past the blank line; they belong to
    /// the tunnel and must reach the upstream first.
    pub buffered: Vec<u8>,
}

impl ProxyRequest {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Destination host and port. CONNECT carries `host:port` directly;
    /// forward requests carry an absolute URI or fall back to the Host
    /// header, defaulting the port from the scheme.
    pub fn host_port(&self) -> io::Result<(String, u16)> {
        if self.is_connect() {
            return split_authority(&self.target, 443);
        }
        if self.target.starts_with("http://") || self.target.starts_with("https://") {
            let parsed = url::Url::parse(&self.target)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| bad_request("request target has no host"))?
                .to_string();
            let port = parsed.port_or_known_default().unwrap_or(80);
            return Ok((host, port));
        }
        let host = self
            .header("Host")
            .ok_or_else(|| bad_request("request has no Host header"))?;
        split_authority(host, 80)
    }

    /// Re-serialise a forward request in origin-form for the upstream,
    /// dropping the proxy-hop headers.
    pub fn serialize_origin_form(&self) -> io::Result<Vec<u8>> {
        let path = if self.target.starts_with("http://") || self.target.starts_with("https://") {
            let parsed = url::Url::parse(&self.target)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let mut path = parsed.path().to_string();
            if let Some(q) = parsed.query() {
                path.push('?');
                path.push_str(q);
            }
            path
        } else {
            self.target.clone()
        };

        let mut head = format!("{} {} {}\r\n", self.method, path, self.version);
        let mut has_host = false;
        for (k, v) in &self.headers {
            if k.eq_ignore_ascii_case("Proxy-Authorization")
                || k.eq_ignore_ascii_case("Proxy-Connection")
            {
                continue;
            }
            if k.eq_ignore_ascii_case("Host") {
                has_host = true;
            }
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        if !has_host {
            let (host, port) = self.host_port()?;
            head.push_str(&format!("Host: {host}:{port}\r\n"));
        }
        head.push_str("\r\n");
        Ok(head.into_bytes())
    }
}

fn bad_request(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// `host:port` (brackets stripped for IPv6), with a default port.
fn split_authority(authority: &str, default_port: u16) -> io::Result<(String, u16)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| bad_request("unterminated ipv6 literal"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| bad_request("invalid port in request target"))?,
            None => default_port,
        };
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse()
                    .map_err(|_| bad_request("invalid port in request target"))?;
                (h.to_string(), port)
            }
            None => (authority.to_string(), default_port),
        }
    };
    if host.is_empty() {
        return Err(bad_request("empty host in request target"));
    }
    Ok((host, port))
}

/// Read one request head, bounded by `timeout`.
pub async fn read_request(stream: &mut TcpStream, timeout: Duration) -> io::Result<ProxyRequest> {
    tokio::time::timeout(timeout, read_request_inner(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client request timeout"))?
}

async fn read_request_inner(stream: &mut TcpStream) -> io::Result<ProxyRequest> {
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut parts = line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
        _ => return Err(bad_request("invalid request line")),
    };

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let buffered = reader.buffer().to_vec();
    Ok(ProxyRequest {
        method,
        target,
        version,
        headers,
        buffered,
    })
}

/// Basic auth over `Proxy-Authorization`. Empty configured credentials mean
/// no auth is required.
pub fn authorized(req: &ProxyRequest, username: &str, password: &str) -> bool {
    if username.is_empty() && password.is_empty() {
        return true;
    }
    let Some(value) = req.header("Proxy-Authorization") else {
        return false;
    };
    let Some(token) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(token.trim()) else {
        return false;
    };
    let Ok(text) = std::str::from_utf8(&decoded) else {
        return false;
    };
    match text.split_once(':') {
        Some((u, p)) => u == username && p == password,
        None => false,
    }
}

/// Write `HTTP/1.1 <status>` plus optional headers and a blank line.
pub async fn write_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: &str,
    headers: &[(&str, &str)],
) -> io::Result<()> {
    let mut out = format!("HTTP/1.1 {status}\r\n");
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    w.write_all(out.as_bytes()).await
}

/// Splice client ↔ upstream until both directions reach EOF. Each EOF
/// half-closes the opposite write side; the counterpart is awaited. Any
/// transport error surfaces as `Err` so callers can count it as a failure.
pub async fn relay(
    mut client: TcpStream,
    mut upstream: TcpStream,
    initial: &[u8],
) -> io::Result<(u64, u64)> {
    if !initial.is_empty() {
        upstream.write_all(initial).await?;
    }
    let (mut cr, mut cw) = client.split();
    let (mut ur, mut uw) = upstream.split();

    let client_to_upstream = async {
        let n = tokio::io::copy(&mut cr, &mut uw).await?;
        let _ = uw.shutdown().await;
        Ok::<u64, io::Error>(n)
    };
    let upstream_to_client = async {
        let n = tokio::io::copy(&mut ur, &mut cw).await?;
        let _ = cw.shutdown().await;
        Ok::<u64, io::Error>(n)
    };

    let (up, down) = tokio::join!(client_to_upstream, upstream_to_client);
    Ok((up?, down?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn parse(raw: &str) -> ProxyRequest {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let raw = raw.to_string();
        let writer = tokio::spawn(async move {
            let mut c = TcpStream::connect(addr).await.unwrap();
            c.write_all(raw.as_bytes()).await.unwrap();
            c
        });
        let (mut stream, _) = listener.accept().await.unwrap();
        let req = read_request(&mut stream, Duration::from_secs(5)).await.unwrap();
        drop(writer.await.unwrap());
        req
    }

    #[tokio::test]
    async fn parses_connect_request() {
        let req = parse("CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await;
        assert!(req.is_connect());
        assert_eq!(req.host_port().unwrap(), ("example.com".into(), 443));
    }

    #[tokio::test]
    async fn parses_forward_request_with_absolute_uri() {
        let req = parse("GET http://example.com/x?y=1 HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(!req.is_connect());
        assert_eq!(req.host_port().unwrap(), ("example.com".into(), 80));
        let head = String::from_utf8(req.serialize_origin_form().unwrap()).unwrap();
        assert!(head.starts_with("GET /x?y=1 HTTP/1.1\r\n"));
        assert!(head.contains("Host: example.com"));
    }

    #[tokio::test]
    async fn proxy_headers_are_stripped() {
        let req = parse(
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic eDp5\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
        )
        .await;
        let head = String::from_utf8(req.serialize_origin_form().unwrap()).unwrap();
        assert!(!head.contains("Proxy-Authorization"));
        assert!(!head.contains("Proxy-Connection"));
        assert!(head.contains("Accept: */*"));
    }

    #[tokio::test]
    async fn early_tunnel_bytes_are_preserved() {
        let req = parse("CONNECT h:443 HTTP/1.1\r\n\r\nEARLY").await;
        assert_eq!(req.buffered, b"EARLY");
    }

    #[test]
    fn basic_auth_checks() {
        let req = ProxyRequest {
            method: "CONNECT".into(),
            target: "h:443".into(),
            version: "HTTP/1.1".into(),
            headers: vec![(
                "Proxy-Authorization".into(),
                format!("Basic {}", STANDARD.encode("user:pw")),
            )],
            buffered: Vec::new(),
        };
        assert!(authorized(&req, "user", "pw"));
        assert!(!authorized(&req, "user", "other"));
        assert!(authorized(&req, "", ""));

        let bare = ProxyRequest {
            method: "CONNECT".into(),
            target: "h:443".into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
            buffered: Vec::new(),
        };
        assert!(!authorized(&bare, "user", "pw"));
    }

    #[tokio::test]
    async fn relay_half_closes_and_reports_totals() {
        let upstream_l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_l.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut s, _) = upstream_l.accept().await.unwrap();
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let client_l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_l.local_addr().unwrap();
        let client_side = tokio::spawn(async move {
            let mut c = TcpStream::connect(client_addr).await.unwrap();
            c.write_all(b"ping").await.unwrap();
            c.shutdown().await.unwrap();
            let mut buf = Vec::new();
            c.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let (client_conn, _) = client_l.accept().await.unwrap();
        let upstream_conn = TcpStream::connect(upstream_addr).await.unwrap();
        let (up, down) = relay(client_conn, upstream_conn, b"").await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
        assert_eq!(client_side.await.unwrap(), b"ping");
        echo.await.unwrap();
    }
}
