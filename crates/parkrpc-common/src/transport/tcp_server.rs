use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::protocol::error::{ParkrpcError, Result};
use crate::protocol::{Request, Response};
use crate::transport::codec::JsonCodec;

/// Maximum message size (100 MB)
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Async TCP server used by nodes, the directory and the coordinator.
///
/// Accepts connections in a loop and spawns a task per connection; each
/// connection processes requests until the peer closes it.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Creates a new TCP server bound to the specified address.
    pub async fn new(bind_addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ParkrpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ParkrpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Runs the server with the given request handler.
    ///
    /// Handler errors become failed `Response`s with their wire error code;
    /// they never tear the connection down.
    pub async fn run_with_handler<F, Fut>(&self, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            let (stream, peer_addr) = self.listener.accept().await.map_err(|e| {
                ParkrpcError::Connection(format!("Failed to accept connection: {}", e))
            })?;

            debug!(peer = %peer_addr, "connection established");

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection error");
                }
            });
        }
    }
}

/// Handle a single TCP connection.
///
/// Processes multiple requests until the connection is closed.
async fn handle_connection<F, Fut>(mut stream: TcpStream, handler: Arc<F>) -> Result<()>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Response>> + Send + 'static,
{
    loop {
        // Read length prefix
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed by peer
                return Ok(());
            }
            Err(e) => {
                return Err(ParkrpcError::Connection(format!(
                    "Failed to read length: {}",
                    e
                )));
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;
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
            .map_err(|e| ParkrpcError::Connection(format!("Failed to read data: {}", e)))?;

        // Decode request
        let request = match JsonCodec::decode_request(&buf) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "failed to decode request");
                let err = ParkrpcError::InvalidRequest(e.to_string());
                let _ = send_response(&mut stream, &Response::failure(0, &err)).await;
                continue;
            }
        };

        // Handle request
        let request_id = request.id;
        let response = match handler(request).await {
            Ok(resp) => resp,
            Err(e) => Response::failure(request_id, &e),
        };

        send_response(&mut stream, &response).await?;
    }
}

/// Send a response with length prefix
async fn send_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let encoded = JsonCodec::encode_response(response)?;

    let len = encoded.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| ParkrpcError::Connection(format!("Failed to send response length: {}", e)))?;
    stream
        .write_all(&encoded)
        .await
        .map_err(|e| ParkrpcError::Connection(format!("Failed to send response data: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_tcp_server_creation() {
        let server = TcpServer::new("127.0.0.1:0").await;
        assert!(server.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_server_local_addr() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        assert!(server.local_addr().is_ok());
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let _ = server
                .run_with_handler(|req| async move {
                    Ok(Response::success(req.id, json!({"echo": req.method})))
                })
                .await;
        });

        let transport = TcpTransport::new().unwrap();
        let request = Request::new("probe", json!({}));
        let response = transport.call(&addr.to_string(), &request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.result, Some(json!({"echo": "probe"})));

        handle.abort();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_response() {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let _ = server
                .run_with_handler(|_req| async move {
                    Err(ParkrpcError::ServiceUnavailable("store is down".to_string()))
                })
                .await;
        });

        let transport = TcpTransport::new().unwrap();
        let request = Request::new("probe", json!({}));
        let response = transport.call(&addr.to_string(), &request).await.unwrap();
        assert!(!response.success);
        assert!(matches!(
            response.into_result(),
            Err(ParkrpcError::ServiceUnavailable(_))
        ));

        handle.abort();
    }
}
