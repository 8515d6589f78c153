use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;

use parkrpc_common::transport::TcpServer;
use parkrpc_common::{ParkrpcError, Request, Response, Result};

use crate::record::NodeRef;

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct BindParams {
    name: String,
    identity: String,
    addr: String,
}

/// In-memory naming service.
///
/// Holds a flat map of name-to-node bindings and serves the
/// `dir_list/dir_resolve/dir_bind/dir_rebind/dir_unbind` methods over the
/// common transport. A `BTreeMap` keeps listing order stable across
/// refreshes, which the coordinator's next-in-order election relies on.
#[derive(Clone, Default)]
pub struct DirectoryServer {
    bindings: Arc<RwLock<BTreeMap<String, NodeRef>>>,
}

impl DirectoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles one directory request.
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        match request.method.as_str() {
            "dir_list" => {
                let bindings = self.bindings.read().await;
                let entries: Vec<_> = bindings
                    .iter()
                    .map(|(name, node)| {
                        json!({"name": name, "identity": node.identity, "addr": node.addr})
                    })
                    .collect();
                Ok(Response::success(request.id, json!({ "bindings": entries })))
            }
            "dir_resolve" => {
                let params: NameParams = parse_args(request.args)?;
                let bindings = self.bindings.read().await;
                match bindings.get(&params.name) {
                    Some(node) => Ok(Response::success(
                        request.id,
                        json!({"identity": node.identity, "addr": node.addr}),
                    )),
                    None => Err(ParkrpcError::NameNotFound(params.name)),
                }
            }
            "dir_bind" => {
                let params: BindParams = parse_args(request.args)?;
                let mut bindings = self.bindings.write().await;
                if bindings.contains_key(&params.name) {
                    return Err(ParkrpcError::InvalidRequest(format!(
                        "Name already bound: {}",
                        params.name
                    )));
                }
                info!(name = %params.name, addr = %params.addr, "bound");
                bindings.insert(params.name, NodeRef::new(params.identity, params.addr));
                Ok(Response::success(request.id, json!({})))
            }
            "dir_rebind" => {
                let params: BindParams = parse_args(request.args)?;
                let mut bindings = self.bindings.write().await;
                info!(name = %params.name, addr = %params.addr, "rebound");
                bindings.insert(params.name, NodeRef::new(params.identity, params.addr));
                Ok(Response::success(request.id, json!({})))
            }
            "dir_unbind" => {
                let params: NameParams = parse_args(request.args)?;
                let mut bindings = self.bindings.write().await;
                match bindings.remove(&params.name) {
                    Some(_) => {
                        info!(name = %params.name, "unbound");
                        Ok(Response::success(request.id, json!({})))
                    }
                    None => Err(ParkrpcError::NameNotFound(params.name)),
                }
            }
            other => Err(ParkrpcError::InvalidRequest(format!(
                "Unknown directory method: {}",
                other
            ))),
        }
    }

    /// Binds a listener and serves the directory until the task is dropped.
    ///
    /// Returns the actual listen address and the serving task handle.
    pub async fn serve(
        self,
        bind_addr: &str,
    ) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let server = TcpServer::new(bind_addr).await?;
        let addr = server.local_addr()?;
        info!(%addr, "directory service listening");

        let handle = tokio::spawn(async move {
            let directory = self;
            let _ = server
                .run_with_handler(move |request| {
                    let directory = directory.clone();
                    async move { directory.handle_request(request).await }
                })
                .await;
        });

        Ok((addr, handle))
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| ParkrpcError::InvalidRequest(format!("Bad arguments: {}", e)))
}
