//! HTTP CONNECT upstream connector with optional Basic auth.
//!
//! Used two ways: as the connector for `http://` upstream proxy nodes, and
//! by virtual pools to chain through a node's own multi-port listener so
//! that member-state bookkeeping happens exactly once per traffic
//! connection.

use std::io;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::OutboundConnector;

#[derive(Debug)]
pub struct HttpUpstream {
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
}

impl HttpUpstream {
    pub fn new(
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            server,
            port,
            username,
            password,
        }
    }

    /// `http://[user:pass@]host:port`
    pub fn from_uri(uri: &str) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(uri)?;
        let server = parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("upstream uri {uri:?} has no host"))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("upstream uri {uri:?} has no port"))?;
        let username = (!parsed.username().is_empty()).then(|| parsed.username().to_string());
        let password = parsed.password().map(str::to_string);
        Ok(Self::new(server, port, username, password))
    }

    fn proxy_authorization(&self) -> Option<String> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_deref().unwrap_or("");
        Some(STANDARD.encode(format!("{user}:{pass}")))
    }
}

#[async_trait::async_trait]
impl OutboundConnector for HttpUpstream {
    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect((self.server.as_str(), self.port)).await?;

        let mut req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let Some(token) = self.proxy_authorization() {
            req.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        req.push_str("\r\n");
        stream.write_all(req.as_bytes()).await?;

        // Read the response head; the stream is a raw tunnel afterwards.
        {
            let mut reader = BufReader::new(&mut stream);
            let mut status_line = String::new();
            reader.read_line(&mut status_line).await?;
            let ok = status_line.starts_with("HTTP/1.1 200")
                || status_line.starts_with("HTTP/1.0 200");
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await?;
                if line.trim().is_empty() {
                    break;
                }
            }
            if !ok {
                return Err(io::Error::other(format!(
                    "upstream proxy refused tunnel: {}",
                    status_line.trim()
                )));
            }
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_uri_parses_credentials_and_port() {
        let up = HttpUpstream::from_uri("http://user:pw@proxy.example:3128").unwrap();
        assert_eq!(up.server, "proxy.example");
        assert_eq!(up.port, 3128);
        assert_eq!(
            up.proxy_authorization().unwrap(),
            STANDARD.encode("user:pw")
        );
    }

    #[test]
    fn from_uri_defaults_port_by_scheme() {
        let up = HttpUpstream::from_uri("http://proxy.example").unwrap();
        assert_eq!(up.port, 80);
        assert!(up.proxy_authorization().is_none());
    }
}
