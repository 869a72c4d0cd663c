//! Plain TCP connector.

use tokio::net::TcpStream;

use super::OutboundConnector;

#[derive(Debug)]
pub struct Direct;

#[async_trait::async_trait]
impl OutboundConnector for Direct {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}
