//! Raw-socket SCPI over LAN
//!
//! LXI instruments (34465A, DMM6500) accept SCPI lines on a plain TCP socket,
//! port 5025 by convention. Replies are newline-terminated.

use super::{ScpiTransport, LINE_TERMINATOR};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Conventional SCPI raw-socket port.
pub const SCPI_RAW_PORT: u16 = 5025;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct TcpAdapter {
    host: String,
    port: u16,

    /// Connect and reply timeout
    timeout: Duration,

    connection: Option<Connection>,
}

impl TcpAdapter {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            timeout: Duration::from_secs(5),
            connection: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        let endpoint = self.endpoint();
        self.connection
            .as_mut()
            .ok_or_else(|| anyhow!("Socket to {} not connected", endpoint))
    }
}

#[async_trait]
impl ScpiTransport for TcpAdapter {
    fn adapter_type(&self) -> &str {
        "tcp"
    }

    fn info(&self) -> String {
        format!(
            "TcpAdapter({} @ {}ms timeout)",
            self.endpoint(),
            self.timeout.as_millis()
        )
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        let endpoint = self.endpoint();
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", endpoint))?
            .with_context(|| format!("Failed to connect to {}", endpoint))?;
        stream
            .set_nodelay(true)
            .context("Failed to disable Nagle on socket")?;

        let (read_half, write_half) = stream.into_split();
        self.connection = Some(Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
        });
        debug!("Socket to {} open", endpoint);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut connection) = self.connection.take() {
            // the peer may already be gone; nothing left to release then
            let _ = connection.writer.shutdown().await;
            debug!("Socket to {} closed", self.endpoint());
        }
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let connection = self.connection()?;
        connection
            .writer
            .write_all(format!("{}{}", command, LINE_TERMINATOR).as_bytes())
            .await
            .with_context(|| format!("Socket write failed for: {}", command))?;
        connection.writer.flush().await?;
        debug!("Sent socket command: {}", command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;

        let timeout = self.timeout;
        let connection = self.connection()?;
        let mut response = String::new();
        let read = tokio::time::timeout(timeout, connection.reader.read_line(&mut response))
            .await
            .map_err(|_| anyhow!("no reply to '{}' within {:?}", command, timeout))?
            .with_context(|| format!("Socket read failed for: {}", command))?;
        if read == 0 {
            return Err(anyhow!("peer closed the socket while answering '{}'", command));
        }

        let response = response.trim().to_string();
        debug!("Socket query '{}' -> '{}'", command, response);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_adapter_creation() {
        let adapter = TcpAdapter::new("192.168.7.201".to_string(), SCPI_RAW_PORT);
        assert_eq!(adapter.adapter_type(), "tcp");
        assert!(!adapter.is_connected());
        assert!(adapter.info().contains("192.168.7.201:5025"));
    }

    #[tokio::test]
    async fn test_write_before_connect_fails() {
        let mut adapter = TcpAdapter::new("127.0.0.1".to_string(), SCPI_RAW_PORT);
        assert!(adapter.write("*RST").await.is_err());
    }

    #[tokio::test]
    async fn test_query_roundtrip_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            let received = String::from_utf8_lossy(&buf[..n]).to_string();
            socket
                .write_all(b"KEYSIGHT TECHNOLOGIES,34465A,MY123,A.03\n")
                .await
                .unwrap();
            received
        });

        let mut adapter = TcpAdapter::new("127.0.0.1".to_string(), port)
            .with_timeout(Duration::from_secs(2));
        adapter.connect().await.unwrap();
        let reply = adapter.query("*IDN?").await.unwrap();
        assert_eq!(reply, "KEYSIGHT TECHNOLOGIES,34465A,MY123,A.03");
        assert_eq!(server.await.unwrap(), "*IDN?\r\n");

        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
    }
}
