use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

use parkrpc_common::{ParkrpcError, Result};
use parkrpc_directory::Directory;

use crate::config::FailoverConfig;
use crate::monitor::{ClientBinding, HealthMonitor, RecoverOutcome, RecoverRequest};

/// One remote lot operation.
///
/// An explicit tagged type instead of a generic "invoke this name"
/// dispatch: the retry wrapper stays generic while every call site remains
/// statically checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    EnterLot { lot: u32 },
    ExitLot,
    MoveUpLevel,
    MoveDownLevel,
    CurrentLevel,
    MaxLevel,
    MinLevel,
    Lots,
    OtherLotAvailability { lot: u32 },
    CloseSession,
}

impl Operation {
    /// Wire method name.
    pub fn method(&self) -> &'static str {
        match self {
            Operation::EnterLot { .. } => "enter_lot",
            Operation::ExitLot => "exit_lot",
            Operation::MoveUpLevel => "move_up_level",
            Operation::MoveDownLevel => "move_down_level",
            Operation::CurrentLevel => "current_level",
            Operation::MaxLevel => "max_level",
            Operation::MinLevel => "min_level",
            Operation::Lots => "get_lots",
            Operation::OtherLotAvailability { .. } => "other_lot_availability",
            Operation::CloseSession => "close_session",
        }
    }

    /// True for state-changing operations, which carry a sequence number.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Operation::EnterLot { .. }
                | Operation::ExitLot
                | Operation::MoveUpLevel
                | Operation::MoveDownLevel
        )
    }

    /// Builds the wire arguments for this operation.
    pub fn args(&self, client_id: Option<u64>, seq: Option<u64>) -> serde_json::Value {
        let mut args = match self {
            Operation::EnterLot { lot } => json!({ "lot": lot }),
            Operation::OtherLotAvailability { lot } => json!({ "lot": lot }),
            Operation::Lots => json!({}),
            _ => json!({}),
        };
        let map = args.as_object_mut().expect("args are always an object");
        if let Some(client_id) = client_id {
            // get_lots and other_lot_availability are not session-scoped
            if !matches!(self, Operation::Lots | Operation::OtherLotAvailability { .. }) {
                map.insert("client_id".to_string(), json!(client_id));
            }
        }
        if let Some(seq) = seq {
            map.insert("seq".to_string(), json!(seq));
        }
        args
    }
}

/// Client-side failover manager.
///
/// Wraps a bound node session and hides node failures from the caller:
/// transient failures (transport errors and `ServiceUnavailable`) drive a
/// reconnection through the background health monitor, application
/// errors propagate verbatim, and an identity mismatch is fatal. The only
/// transient failure a caller ever sees is a single `ServiceUnavailable`
/// when no primary is registered at all and the manager is allowed to give
/// up.
///
/// The manager owns sequence-number generation: each state-changing
/// operation gets one number, reused verbatim across its retries, so the
/// server-side ledger can recognize redeliveries. Not safe for concurrent
/// foreground callers; wrap it externally when sharing across tasks.
#[derive(Debug)]
pub struct FailoverManager {
    config: FailoverConfig,
    binding: Arc<Mutex<ClientBinding>>,
    recover_tx: mpsc::Sender<RecoverRequest>,
    shutdown_tx: watch::Sender<bool>,
    monitor: Option<tokio::task::JoinHandle<()>>,
    recoveries: Arc<AtomicU64>,
}

impl FailoverManager {
    /// Connects to the system through the given directory service.
    ///
    /// Construction only succeeds once a session is bound to some node;
    /// otherwise `ServiceUnavailable` is returned (after the configured
    /// retry policy is exhausted).
    pub async fn connect(directory_addr: &str, config: FailoverConfig) -> Result<Self> {
        if config.host_id.is_empty() {
            return Err(ParkrpcError::InvalidRequest(
                "A host identity is required for session binding".to_string(),
            ));
        }

        let binding = Arc::new(Mutex::new(ClientBinding::default()));
        let recoveries = Arc::new(AtomicU64::new(0));
        let (recover_tx, recover_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (startup_tx, startup_rx) = oneshot::channel();

        let monitor = HealthMonitor::spawn(
            config.clone(),
            Directory::new(directory_addr),
            Arc::clone(&binding),
            recover_rx,
            shutdown_rx,
            startup_tx,
            Arc::clone(&recoveries),
        );

        let connected = startup_rx.await.unwrap_or(false);
        if !connected {
            monitor.abort();
            return Err(ParkrpcError::ServiceUnavailable(
                "Could not connect to any server".to_string(),
            ));
        }

        Ok(Self {
            config,
            binding,
            recover_tx,
            shutdown_tx,
            monitor: Some(monitor),
            recoveries,
        })
    }

    /// The server-assigned client identity.
    pub fn client_id(&self) -> Option<u64> {
        self.binding.lock().unwrap().client_id
    }

    /// Identity of the currently bound node, if any.
    pub fn bound_identity(&self) -> Option<String> {
        self.binding
            .lock()
            .unwrap()
            .node
            .as_ref()
            .map(|session| session.identity().to_string())
    }

    /// Election-assist cycles run so far. Diagnostic.
    pub fn recovery_count(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }

    /// Executes one operation with transparent failover.
    pub async fn call(&self, op: Operation) -> Result<serde_json::Value> {
        // One sequence number per logical operation, reused verbatim across
        // its retries. The number is consumed whatever the outcome: a later
        // operation must never reuse a number the ledger may already hold,
        // and the ledger tolerates gaps.
        let seq = if op.is_mutating() {
            Some(self.binding.lock().unwrap().last_seq + 1)
        } else {
            None
        };

        let result = self.call_with_seq(&op, seq).await;
        if let Some(seq) = seq {
            self.binding.lock().unwrap().last_seq = seq;
        }
        result
    }

    async fn call_with_seq(&self, op: &Operation, seq: Option<u64>) -> Result<serde_json::Value> {
        let mut attempts = 0u32;
        loop {
            let (node, client_id) = {
                let binding = self.binding.lock().unwrap();
                (binding.node.clone(), binding.client_id)
            };

            let result = match &node {
                Some(session) => session.invoke(op.method(), op.args(client_id, seq)).await,
                None => Err(ParkrpcError::Connection(
                    "No server is currently bound".to_string(),
                )),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    info!(
                        error = %e,
                        "problem while communicating with the server; getting another server"
                    );

                    // From the second consecutive failure on, give the
                    // coordinator time to observe the same fault and
                    // re-elect before we hunt for a new node
                    if attempts >= 2 && !self.config.recovery_timeout.is_zero() {
                        tokio::time::sleep(self.config.recovery_timeout).await;
                    }

                    let faulty = node.map(|session| session.identity().to_string());
                    let recovered = self.request_recovery(faulty).await?;

                    if !recovered && !self.config.never_give_up {
                        let system_down = self.binding.lock().unwrap().system_down;
                        if system_down {
                            info!("no servers are up");
                            return Err(match e {
                                e @ ParkrpcError::ServiceUnavailable(_) => e,
                                other => ParkrpcError::ServiceUnavailable(other.to_string()),
                            });
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Hands the fault to the monitor and waits for the outcome.
    ///
    /// At most one recovery episode runs at a time: requests queue on the
    /// monitor's channel, and a request whose faulty node has already been
    /// replaced is answered without a fresh election-assist cycle.
    async fn request_recovery(&self, faulty: Option<String>) -> Result<bool> {
        let (done_tx, done_rx) = oneshot::channel();
        let request = RecoverRequest {
            faulty,
            done: done_tx,
        };
        if self.recover_tx.send(request).await.is_err() {
            return Ok(false);
        }
        match done_rx.await {
            Ok(RecoverOutcome::Rebound) => Ok(true),
            Ok(RecoverOutcome::Failed) => Ok(false),
            Ok(RecoverOutcome::Fatal(e)) => Err(e),
            Err(_) => Ok(false),
        }
    }

    // Typed operation surface

    /// Enters the given lot; returns the levels that still have space.
    pub async fn enter_lot(&self, lot: u32) -> Result<Vec<u32>> {
        let value = self.call(Operation::EnterLot { lot }).await?;
        parse_field(value, "levels")
    }

    /// Exits the current lot.
    pub async fn exit_lot(&self) -> Result<()> {
        self.call(Operation::ExitLot).await.map(|_| ())
    }

    /// Moves one level up; returns the new level.
    pub async fn move_up_level(&self) -> Result<u32> {
        let value = self.call(Operation::MoveUpLevel).await?;
        parse_field(value, "level")
    }

    /// Moves one level down; returns the new level.
    pub async fn move_down_level(&self) -> Result<u32> {
        let value = self.call(Operation::MoveDownLevel).await?;
        parse_field(value, "level")
    }

    pub async fn current_level(&self) -> Result<u32> {
        let value = self.call(Operation::CurrentLevel).await?;
        parse_field(value, "level")
    }

    pub async fn max_level(&self) -> Result<u32> {
        let value = self.call(Operation::MaxLevel).await?;
        parse_field(value, "level")
    }

    pub async fn min_level(&self) -> Result<u32> {
        let value = self.call(Operation::MinLevel).await?;
        parse_field(value, "level")
    }

    /// All lot numbers known to the system.
    pub async fn lots(&self) -> Result<Vec<u32>> {
        let value = self.call(Operation::Lots).await?;
        parse_field(value, "lots")
    }

    /// Other lots with availability, nearest first.
    pub async fn other_lot_availability(&self, lot: u32) -> Result<Vec<u32>> {
        let value = self.call(Operation::OtherLotAvailability { lot }).await?;
        parse_field(value, "lots")
    }

    /// Severs the bound node's store. Fault-injection helper for test/ops
    /// tooling; sent once to the bound node, no failover.
    pub async fn inject_store_failure(&self) -> Result<()> {
        let node = self.binding.lock().unwrap().node.clone();
        match node {
            Some(session) => session
                .invoke("inject_store_failure", json!({}))
                .await
                .map(|_| ()),
            None => Err(ParkrpcError::Connection(
                "No server is currently bound".to_string(),
            )),
        }
    }

    /// Closes the remote session and tears the monitor down. The manager
    /// must not be used afterwards.
    pub async fn close(mut self) -> Result<()> {
        let result = self.call(Operation::CloseSession).await.map(|_| ());
        let _ = self.shutdown_tx.send(true);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.await;
        }
        result
    }
}

impl Drop for FailoverManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

fn parse_field<T: serde::de::DeserializeOwned>(
    mut value: serde_json::Value,
    key: &str,
) -> Result<T> {
    let field = value
        .get_mut(key)
        .map(serde_json::Value::take)
        .unwrap_or(serde_json::Value::Null);
    serde_json::from_value(field).map_err(|e| {
        ParkrpcError::InvalidRequest(format!("Missing or malformed '{}' in response: {}", key, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_method_names() {
        assert_eq!(Operation::EnterLot { lot: 2 }.method(), "enter_lot");
        assert_eq!(Operation::ExitLot.method(), "exit_lot");
        assert_eq!(Operation::Lots.method(), "get_lots");
        assert_eq!(
            Operation::OtherLotAvailability { lot: 1 }.method(),
            "other_lot_availability"
        );
    }

    #[test]
    fn test_mutating_operations_carry_seq() {
        assert!(Operation::EnterLot { lot: 1 }.is_mutating());
        assert!(Operation::ExitLot.is_mutating());
        assert!(Operation::MoveUpLevel.is_mutating());
        assert!(Operation::MoveDownLevel.is_mutating());
        assert!(!Operation::CurrentLevel.is_mutating());
        assert!(!Operation::Lots.is_mutating());
        assert!(!Operation::CloseSession.is_mutating());
    }

    #[test]
    fn test_args_shape() {
        let args = Operation::EnterLot { lot: 3 }.args(Some(7), Some(4));
        assert_eq!(args, json!({"client_id": 7, "seq": 4, "lot": 3}));

        let args = Operation::CurrentLevel.args(Some(7), None);
        assert_eq!(args, json!({"client_id": 7}));

        let args = Operation::Lots.args(Some(7), None);
        assert_eq!(args, json!({}));
    }

    #[tokio::test]
    async fn test_connect_requires_host_identity() {
        let mut config = FailoverConfig::for_host("");
        config.never_give_up = false;
        let err = FailoverManager::connect("127.0.0.1:1", config)
            .await
            .unwrap_err();
        assert!(matches!(err, ParkrpcError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connect_with_unreachable_directory_fails() {
        let config = FailoverConfig::for_host("client-host");
        let err = FailoverManager::connect("127.0.0.1:1", config)
            .await
            .unwrap_err();
        assert!(matches!(err, ParkrpcError::ServiceUnavailable(_)));
    }
}
