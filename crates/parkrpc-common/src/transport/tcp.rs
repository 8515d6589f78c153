use std::net::ToSocketAddrs;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::protocol::error::{ParkrpcError, Result};
use crate::protocol::{Request, Response};
use crate::transport::codec::JsonCodec;

/// Default timeout for connection establishment (5 seconds)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Async TCP transport.
///
/// Every request opens a fresh connection: the failover layer treats nodes
/// as disposable, and a shared connection would only serialize callers and
/// hide node death behind stale sockets.
///
/// # Wire Protocol
///
/// Messages are sent with a 4-byte length prefix (big-endian u32) followed
/// by the JSON-encoded data:
///
/// ```text
/// [4-byte length] [JSON data]
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    /// Creates a new TCP transport instance.
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    /// Connects to a remote endpoint.
    ///
    /// The address may resolve to multiple socket addresses; each is tried
    /// until one succeeds. Connection establishment is bounded by a 5s
    /// timeout so a black-holed node cannot stall the caller indefinitely.
    pub async fn connect(&self, addr: &str) -> Result<tokio::net::TcpStream> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| ParkrpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            let connect = tokio::net::TcpStream::connect(&socket_addr);
            match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("connect timed out after {:?}", CONNECT_TIMEOUT)),
            }
        }

        Err(ParkrpcError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    /// Sends a request and waits for the response.
    ///
    /// Combines `send_message` and `receive_message` with JSON
    /// encoding/decoding. The caller bounds the whole exchange with
    /// `tokio::time::timeout` where a deadline matters (probes, session
    /// binds).
    pub async fn send_request(
        &self,
        stream: &mut tokio::net::TcpStream,
        request: &Request,
    ) -> Result<Response> {
        let encoded = JsonCodec::encode_request(request)?;
        Self::send_message(stream, &encoded).await?;
        let response_data = Self::receive_message(stream).await?;
        let response = JsonCodec::decode_response(&response_data)?;
        Ok(response)
    }

    /// Connects, sends one request and returns the decoded response.
    pub async fn call(&self, addr: &str, request: &Request) -> Result<Response> {
        let mut stream = self.connect(addr).await?;
        self.send_request(&mut stream, request).await
    }

    /// Sends a message with length prefix.
    ///
    /// Wire format: `[4-byte length as u32 big-endian] + [data]`
    pub async fn send_message(stream: &mut tokio::net::TcpStream, data: &[u8]) -> Result<()> {
        let len = data.len() as u32;

        stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix"))?;

        stream
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing data"))?;

        stream
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Receives a message with length prefix.
    ///
    /// Wire format: `[4-byte length as u32 big-endian] + [data]`
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Reading the length prefix fails
    /// - Message exceeds maximum size (100 MB)
    /// - Reading the data fails
    pub async fn receive_message(stream: &mut tokio::net::TcpStream) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;

        // Validate length to prevent allocation of excessively large buffers
        const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024; // 100 MB
        if len > MAX_MESSAGE_SIZE {
            return Err(ParkrpcError::InvalidRequest(format!(
                "Message too large: {} bytes (max {} bytes)",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading data"))?;

        Ok(buf)
    }

    /// Map IO errors to appropriate ParkrpcError variants
    ///
    /// - Timeouts/would block -> `Timeout`
    /// - Connection errors -> `Connection`
    /// - Other IO errors -> `Io`
    fn map_io_error(err: std::io::Error, context: &str) -> ParkrpcError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ParkrpcError::Timeout(CONNECT_TIMEOUT.as_millis() as u64)
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => {
                ParkrpcError::Connection(format!("{}: Connection lost", context))
            }
            _ => ParkrpcError::Io(err),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_transport_creation() {
        let transport = TcpTransport::new();
        assert!(transport.is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_address_is_transient() {
        let transport = TcpTransport::new().unwrap();
        // Port 1 on localhost is essentially guaranteed to refuse
        let err = transport.connect("127.0.0.1:1").await.unwrap_err();
        assert!(err.is_transient(), "connect failure must classify as transient");
    }

    #[tokio::test]
    async fn test_connect_to_invalid_address() {
        let transport = TcpTransport::new().unwrap();
        let err = transport.connect("not an address").await.unwrap_err();
        assert!(matches!(err, ParkrpcError::Connection(_)));
    }
}
