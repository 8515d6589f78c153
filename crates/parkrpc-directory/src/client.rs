use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use parkrpc_common::transport::TcpTransport;
use parkrpc_common::{ParkrpcError, Request, Result};

use crate::record::{DirectorySnapshot, NodeRecord, NodeRef, PRIMARY_NAME};

/// How many times a whole refresh is retried before the directory is
/// reported unreachable.
const MAX_REFRESH_ATTEMPTS: u32 = 3;

/// Per-request deadline against the directory service.
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client adapter for the naming service.
///
/// The directory is refreshed on demand and snapshots are rebuilt wholesale
/// on every refresh. Transient directory failures retry the whole refresh,
/// not individual lookups: a half-refreshed view is worse than a stale one.
#[derive(Clone)]
pub struct Directory {
    addr: String,
    transport: TcpTransport,
}

impl Directory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            transport: TcpTransport,
        }
    }

    /// The directory service address this adapter talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        let request = Request::new(method, args);
        let call = self.transport.call(&self.addr, &request);
        let response = tokio::time::timeout(DIRECTORY_TIMEOUT, call)
            .await
            .map_err(|_| ParkrpcError::Timeout(DIRECTORY_TIMEOUT.as_millis() as u64))??;
        response.into_result()
    }

    /// Lists all current bindings.
    pub async fn list(&self) -> Result<Vec<(String, NodeRef)>> {
        let result = self.call("dir_list", json!({})).await?;
        let entries = result["bindings"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut bindings = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry["name"].as_str().unwrap_or_default().to_string();
            let identity = entry["identity"].as_str().unwrap_or_default().to_string();
            let addr = entry["addr"].as_str().unwrap_or_default().to_string();
            bindings.push((name, NodeRef::new(identity, addr)));
        }
        Ok(bindings)
    }

    /// Resolves a single name.
    pub async fn resolve(&self, name: &str) -> Result<NodeRef> {
        let result = self.call("dir_resolve", json!({ "name": name })).await?;
        Ok(NodeRef::new(
            result["identity"].as_str().unwrap_or_default(),
            result["addr"].as_str().unwrap_or_default(),
        ))
    }

    /// Binds a fresh name; fails when the name is taken.
    pub async fn bind(&self, name: &str, node: &NodeRef) -> Result<()> {
        self.call(
            "dir_bind",
            json!({"name": name, "identity": node.identity, "addr": node.addr}),
        )
        .await?;
        Ok(())
    }

    /// Binds a name, replacing any existing binding.
    pub async fn rebind(&self, name: &str, node: &NodeRef) -> Result<()> {
        self.call(
            "dir_rebind",
            json!({"name": name, "identity": node.identity, "addr": node.addr}),
        )
        .await?;
        Ok(())
    }

    /// Removes a binding. Unbinding an unknown name is not an error for the
    /// caller: the binding is gone either way.
    pub async fn unbind(&self, name: &str) -> Result<()> {
        match self.call("dir_unbind", json!({ "name": name })).await {
            Ok(_) => Ok(()),
            Err(ParkrpcError::NameNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fetches a wholesale snapshot of the registered node set.
    ///
    /// Retries the entire refresh on transient failures. A missing primary
    /// binding is not an error; the snapshot records it as
    /// `primary_registered = false` ("system down" from the client's view).
    pub async fn refresh(&self) -> Result<DirectorySnapshot> {
        let mut last_err = None;
        for attempt in 1..=MAX_REFRESH_ATTEMPTS {
            match self.try_refresh().await {
                Ok(snapshot) => {
                    debug!(
                        nodes = snapshot.nodes.len(),
                        primary = snapshot.primary_registered,
                        "directory refreshed"
                    );
                    return Ok(snapshot);
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "directory refresh failed; retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ParkrpcError::Connection("Directory is not accessible".to_string())
        }))
    }

    async fn try_refresh(&self) -> Result<DirectorySnapshot> {
        let bindings = self.list().await?;

        // The primary name is a pointer to one of the node bindings, not a
        // candidate of its own.
        let mut nodes: Vec<NodeRecord> = bindings
            .into_iter()
            .filter(|(name, _)| name != PRIMARY_NAME)
            .map(|(name, node)| NodeRecord {
                identity: node.identity,
                name,
                addr: node.addr,
                is_primary: false,
            })
            .collect();

        let (primary_registered, primary_identity) = match self.resolve(PRIMARY_NAME).await {
            Ok(primary) => (true, Some(primary.identity)),
            Err(ParkrpcError::NameNotFound(_)) => (false, None),
            Err(e) => return Err(e),
        };

        if let Some(identity) = &primary_identity {
            for node in &mut nodes {
                node.is_primary = node.identity == *identity;
            }
        }

        Ok(DirectorySnapshot {
            nodes,
            primary_registered,
            primary_identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::DirectoryServer;

    async fn start_directory() -> (Directory, tokio::task::JoinHandle<()>) {
        let (addr, handle) = DirectoryServer::new().serve("127.0.0.1:0").await.unwrap();
        (Directory::new(addr.to_string()), handle)
    }

    #[tokio::test]
    async fn test_refresh_empty_directory() {
        let (dir, handle) = start_directory().await;

        let snapshot = dir.refresh().await.unwrap();
        assert!(snapshot.nodes.is_empty());
        assert!(!snapshot.primary_registered);

        handle.abort();
    }

    #[tokio::test]
    async fn test_refresh_marks_primary() {
        let (dir, handle) = start_directory().await;

        let a = NodeRef::new("node-a", "127.0.0.1:9001");
        let b = NodeRef::new("node-b", "127.0.0.1:9002");
        dir.bind("node-a", &a).await.unwrap();
        dir.bind("node-b", &b).await.unwrap();
        dir.rebind(PRIMARY_NAME, &b).await.unwrap();

        let snapshot = dir.refresh().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 2);
        assert!(snapshot.primary_registered);
        assert_eq!(snapshot.primary_identity.as_deref(), Some("node-b"));
        assert!(!snapshot.node("node-a").unwrap().is_primary);
        assert!(snapshot.node("node-b").unwrap().is_primary);

        handle.abort();
    }

    #[tokio::test]
    async fn test_primary_binding_is_not_a_candidate() {
        let (dir, handle) = start_directory().await;

        let a = NodeRef::new("node-a", "127.0.0.1:9001");
        dir.bind("node-a", &a).await.unwrap();
        dir.rebind(PRIMARY_NAME, &a).await.unwrap();

        let snapshot = dir.refresh().await.unwrap();
        assert_eq!(snapshot.nodes.len(), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn test_unbind_unknown_name_is_ok() {
        let (dir, handle) = start_directory().await;
        assert!(dir.unbind("ghost").await.is_ok());
        handle.abort();
    }

    #[tokio::test]
    async fn test_refresh_unreachable_directory_fails() {
        let dir = Directory::new("127.0.0.1:1");
        let err = dir.refresh().await.unwrap_err();
        assert!(err.is_transient());
    }
}
