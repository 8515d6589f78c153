use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use parkrpc_common::transport::{TcpServer, TcpTransport};
use parkrpc_common::{ParkrpcError, Request, Response, Result};
use parkrpc_directory::{Directory, NodeRef};

use crate::perf::PerfLog;
use crate::store::LotStore;

#[derive(Deserialize)]
struct CreateSessionParams {
    host: String,
}

#[derive(Deserialize)]
struct ResumeSessionParams {
    client_id: u64,
    host: String,
}

#[derive(Deserialize)]
struct ClientParams {
    client_id: u64,
}

#[derive(Deserialize)]
struct MutationParams {
    client_id: u64,
    seq: u64,
}

#[derive(Deserialize)]
struct EnterLotParams {
    client_id: u64,
    seq: u64,
    lot: u32,
}

#[derive(Deserialize)]
struct LotParams {
    lot: u32,
}

/// One backend node: session service, lot operations and the admin surface,
/// all dispatched from the common request type onto the store.
///
/// The store handle is shared: every node of one deployment attaches to the
/// same logical persistence engine, which is what lets a client resume its
/// session (and its ledger row) on a different node after a failover.
pub struct LotNode {
    identity: String,
    store: Arc<LotStore>,
    perf: Arc<PerfLog>,
}

impl LotNode {
    pub fn new(identity: impl Into<String>, store: Arc<LotStore>, perf: PerfLog) -> Self {
        Self {
            identity: identity.into(),
            store,
            perf: Arc::new(perf),
        }
    }

    /// Stable node identity, used as the directory name and the quarantine
    /// key.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Handles one request.
    ///
    /// Domain and session errors come back as `Err` and are turned into
    /// failed responses (with their wire code) by the transport layer.
    pub fn handle_request(&self, request: Request) -> Result<Response> {
        let start = Instant::now();
        let id = request.id;
        let method = request.method.clone();

        let result = self.dispatch(request);
        if result.is_ok() && is_domain_method(&method) {
            self.perf.record(&method, start.elapsed());
        }
        result.map(|value| Response::success(id, value))
    }

    fn dispatch(&self, request: Request) -> Result<serde_json::Value> {
        match request.method.as_str() {
            "probe" => {
                self.store.probe()?;
                Ok(json!({}))
            }
            "create_session" => {
                let params: CreateSessionParams = parse_args(request.args)?;
                let client_id = self.store.create_client()?;
                info!(client_id, host = %params.host, "session created");
                Ok(json!({ "client_id": client_id }))
            }
            "resume_session" => {
                let params: ResumeSessionParams = parse_args(request.args)?;
                let row = self.store.resume_client(params.client_id)?;
                info!(
                    client_id = params.client_id,
                    host = %params.host,
                    seq = row.seq,
                    "session resumed"
                );
                Ok(json!({ "client_id": params.client_id }))
            }
            "enter_lot" => {
                let params: EnterLotParams = parse_args(request.args)?;
                let levels = self
                    .store
                    .enter_lot(params.client_id, params.seq, params.lot)?;
                Ok(json!({ "levels": levels }))
            }
            "exit_lot" => {
                let params: MutationParams = parse_args(request.args)?;
                self.store.exit_lot(params.client_id, params.seq)?;
                Ok(json!({}))
            }
            "move_up_level" => {
                let params: MutationParams = parse_args(request.args)?;
                let level = self.store.move_up_level(params.client_id, params.seq)?;
                Ok(json!({ "level": level }))
            }
            "move_down_level" => {
                let params: MutationParams = parse_args(request.args)?;
                let level = self.store.move_down_level(params.client_id, params.seq)?;
                Ok(json!({ "level": level }))
            }
            "current_level" => {
                let params: ClientParams = parse_args(request.args)?;
                let level = self.store.current_level(params.client_id)?;
                Ok(json!({ "level": level }))
            }
            "max_level" => {
                let params: ClientParams = parse_args(request.args)?;
                let level = self.store.max_level(params.client_id)?;
                Ok(json!({ "level": level }))
            }
            "min_level" => {
                let params: ClientParams = parse_args(request.args)?;
                let level = self.store.min_level(params.client_id)?;
                Ok(json!({ "level": level }))
            }
            "get_lots" => {
                let lots = self.store.lots()?;
                Ok(json!({ "lots": lots }))
            }
            "other_lot_availability" => {
                let params: LotParams = parse_args(request.args)?;
                let lots = self.store.other_lot_availability(params.lot)?;
                Ok(json!({ "lots": lots }))
            }
            "close_session" => {
                let params: ClientParams = parse_args(request.args)?;
                self.store.close_client(params.client_id)?;
                info!(client_id = params.client_id, "session closed");
                Ok(json!({}))
            }

            // Admin surface, consumed by ops/test tooling
            "flush_perf_log" => {
                self.perf
                    .flush()
                    .map_err(|e| ParkrpcError::ServiceUnavailable(e.to_string()))?;
                Ok(json!({}))
            }
            "inject_store_failure" => {
                warn!(identity = %self.identity, "store failure injected");
                self.store.inject_failure();
                Ok(json!({}))
            }
            "terminate_gracefully" => {
                info!(identity = %self.identity, "terminating gracefully");
                if let Err(e) = self.perf.flush() {
                    warn!(error = %e, "perf log flush failed during shutdown");
                }
                std::process::exit(0);
            }
            "terminate_immediately" => {
                // Simulates a crash: no flush, nonzero exit
                std::process::exit(1);
            }

            other => Err(ParkrpcError::InvalidRequest(format!(
                "Unknown method: {}",
                other
            ))),
        }
    }

    /// Binds a listener and serves requests until the task is dropped.
    pub async fn serve(
        self: Arc<Self>,
        bind_addr: &str,
    ) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let server = TcpServer::new(bind_addr).await?;
        let addr = server.local_addr()?;
        info!(identity = %self.identity, %addr, "node listening");

        let node = self;
        let handle = tokio::spawn(async move {
            let _ = server
                .run_with_handler(move |request| {
                    let node = node.clone();
                    async move { node.handle_request(request) }
                })
                .await;
        });

        Ok((addr, handle))
    }

    /// Announces this node: binds its identity in the directory, then
    /// notifies the coordinator.
    ///
    /// Coordinator unreachability is logged, not fatal: once the node is in
    /// the directory the coordinator's next refresh or our later restart
    /// registration will pick it up.
    pub async fn register(
        &self,
        directory: &Directory,
        coordinator_addr: Option<&str>,
        own_addr: &str,
    ) -> Result<()> {
        let node_ref = NodeRef::new(self.identity.clone(), own_addr.to_string());
        directory.rebind(&self.identity, &node_ref).await?;
        info!(identity = %self.identity, "registered in directory");

        if let Some(coordinator) = coordinator_addr {
            let request = Request::new(
                "node_registered",
                json!({"identity": self.identity, "addr": own_addr}),
            );
            match TcpTransport.call(coordinator, &request).await {
                Ok(response) => {
                    if let Err(e) = response.into_result() {
                        warn!(error = %e, "coordinator rejected registration");
                    }
                }
                Err(e) => warn!(error = %e, "could not notify coordinator"),
            }
        }
        Ok(())
    }
}

fn is_domain_method(method: &str) -> bool {
    matches!(
        method,
        "enter_lot"
            | "exit_lot"
            | "move_up_level"
            | "move_down_level"
            | "current_level"
            | "max_level"
            | "min_level"
            | "get_lots"
            | "other_lot_availability"
    )
}

fn parse_args<T: serde::de::DeserializeOwned>(args: serde_json::Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| ParkrpcError::InvalidRequest(format!("Bad arguments: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LotSpec;
    use parkrpc_common::LotError;

    fn node() -> LotNode {
        LotNode::new(
            "node-test-9001",
            Arc::new(LotStore::new(vec![
                LotSpec::uniform(1, 3, 2),
                LotSpec::uniform(2, 2, 2),
            ])),
            PerfLog::new(None),
        )
    }

    fn call(node: &LotNode, method: &str, args: serde_json::Value) -> Result<serde_json::Value> {
        node.handle_request(Request::new(method, args))
            .and_then(|r| r.into_result())
    }

    fn create_session(node: &LotNode) -> u64 {
        let result = call(node, "create_session", json!({"host": "client-host"})).unwrap();
        result["client_id"].as_u64().unwrap()
    }

    #[test]
    fn test_probe_ok() {
        let node = node();
        assert!(call(&node, "probe", json!({})).is_ok());
    }

    #[test]
    fn test_session_lifecycle() {
        let node = node();
        let client_id = create_session(&node);

        let resumed = call(
            &node,
            "resume_session",
            json!({"client_id": client_id, "host": "client-host"}),
        )
        .unwrap();
        assert_eq!(resumed["client_id"].as_u64(), Some(client_id));

        call(&node, "close_session", json!({"client_id": client_id})).unwrap();
    }

    #[test]
    fn test_resume_unknown_session() {
        let node = node();
        let err = call(
            &node,
            "resume_session",
            json!({"client_id": 777, "host": "client-host"}),
        )
        .unwrap_err();
        assert!(matches!(err, ParkrpcError::UnknownClient(777)));
    }

    #[test]
    fn test_enter_and_move() {
        let node = node();
        let client_id = create_session(&node);

        let entered = call(
            &node,
            "enter_lot",
            json!({"client_id": client_id, "seq": 1, "lot": 1}),
        )
        .unwrap();
        assert_eq!(entered["levels"], json!([1, 2, 3]));

        let moved = call(
            &node,
            "move_up_level",
            json!({"client_id": client_id, "seq": 2}),
        )
        .unwrap();
        assert_eq!(moved["level"], json!(2));

        let current = call(&node, "current_level", json!({"client_id": client_id})).unwrap();
        assert_eq!(current["level"], json!(2));
    }

    #[test]
    fn test_domain_error_crosses_dispatch() {
        let node = node();
        let client_id = create_session(&node);
        let err = call(
            &node,
            "exit_lot",
            json!({"client_id": client_id, "seq": 1}),
        )
        .unwrap_err();
        assert!(matches!(err, ParkrpcError::Lot(LotError::NotInLot)));
    }

    #[test]
    fn test_unknown_method() {
        let node = node();
        let err = call(&node, "frobnicate", json!({})).unwrap_err();
        assert!(matches!(err, ParkrpcError::InvalidRequest(_)));
    }

    #[test]
    fn test_malformed_args() {
        let node = node();
        let err = call(&node, "enter_lot", json!({"lot": 1})).unwrap_err();
        assert!(matches!(err, ParkrpcError::InvalidRequest(_)));
    }

    #[test]
    fn test_injected_failure_reaches_probe() {
        let node = node();
        call(&node, "inject_store_failure", json!({})).unwrap();
        let err = call(&node, "probe", json!({})).unwrap_err();
        assert!(matches!(err, ParkrpcError::ServiceUnavailable(_)));
    }

    #[test]
    fn test_get_lots() {
        let node = node();
        let result = call(&node, "get_lots", json!({})).unwrap();
        assert_eq!(result["lots"], json!([1, 2]));
    }
}
