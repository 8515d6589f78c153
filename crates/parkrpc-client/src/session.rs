use std::time::Duration;

use serde_json::json;

use parkrpc_common::transport::TcpTransport;
use parkrpc_common::{ParkrpcError, Request, Result};
use parkrpc_directory::NodeRecord;

/// A bound session toward one backend node.
///
/// Thin, stateless RPC wrapper: every call opens a fresh connection and is
/// bounded by the configured call deadline. The failover manager swaps
/// whole `NodeSession` values when it re-homes to another node.
#[derive(Debug)]
pub struct NodeSession {
    record: NodeRecord,
    call_timeout: Duration,
    transport: TcpTransport,
}

impl NodeSession {
    pub fn new(record: NodeRecord, call_timeout: Duration) -> Self {
        Self {
            record,
            call_timeout,
            transport: TcpTransport,
        }
    }

    /// Stable identity of the node this session is bound to.
    pub fn identity(&self) -> &str {
        &self.record.identity
    }

    pub fn addr(&self) -> &str {
        &self.record.addr
    }

    /// Sends one request and decodes the response.
    pub async fn invoke(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        let request =
            Request::new(method, args).with_timeout(self.call_timeout.as_millis() as u64);
        let call = self.transport.call(&self.record.addr, &request);
        let response = tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| ParkrpcError::Timeout(self.call_timeout.as_millis() as u64))??;
        response.into_result()
    }

    /// Health probe with its own (tighter) deadline.
    pub async fn probe(&self, deadline: Duration) -> Result<()> {
        let request = Request::new("probe", json!({}));
        let call = self.transport.call(&self.record.addr, &request);
        let response = tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| ParkrpcError::Timeout(deadline.as_millis() as u64))??;
        response.into_result().map(|_| ())
    }

    /// Creates a fresh session and returns the server-assigned client
    /// identity.
    pub async fn create_session(&self, host: &str) -> Result<u64> {
        let result = self
            .invoke("create_session", json!({ "host": host }))
            .await?;
        parse_client_id(&result)
    }

    /// Resumes an existing session; fails with `UnknownClient` when the
    /// identity is not in this node's ledger.
    pub async fn resume_session(&self, client_id: u64, host: &str) -> Result<u64> {
        let result = self
            .invoke(
                "resume_session",
                json!({ "client_id": client_id, "host": host }),
            )
            .await?;
        parse_client_id(&result)
    }
}

fn parse_client_id(result: &serde_json::Value) -> Result<u64> {
    result["client_id"]
        .as_u64()
        .ok_or_else(|| ParkrpcError::InvalidRequest("Missing client_id in response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NodeRecord {
        NodeRecord {
            identity: "node-a".to_string(),
            name: "node-a".to_string(),
            addr: "127.0.0.1:9001".to_string(),
            is_primary: false,
        }
    }

    #[test]
    fn test_session_accessors() {
        let session = NodeSession::new(record(), Duration::from_secs(5));
        assert_eq!(session.identity(), "node-a");
        assert_eq!(session.addr(), "127.0.0.1:9001");
    }

    #[tokio::test]
    async fn test_invoke_against_dead_node_is_transient() {
        let session = NodeSession::new(
            NodeRecord {
                addr: "127.0.0.1:1".to_string(),
                ..record()
            },
            Duration::from_secs(2),
        );
        let err = session.invoke("probe", json!({})).await.unwrap_err();
        assert!(err.is_transient());
    }
}
