use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use parkrpc_common::transport::{TcpServer, TcpTransport};
use parkrpc_common::{ParkrpcError, Request, Response, Result};
use parkrpc_directory::{Directory, Quarantine, PRIMARY_NAME};

use crate::member::{Member, NodeState};
use crate::restart::run_restart;

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Period between health-probe sweeps over the live-node set
    pub detection_interval: Duration,
    /// Per-node probe deadline
    pub probe_timeout: Duration,
    /// Shell template used to restart a dead node (`{identity}`/`{addr}`
    /// substituted); `None` disables restarts
    pub restart_cmd: Option<String>,
    /// Bounded wait for the restart script's success line
    pub restart_wait: Duration,
    /// Cooldown before a node whose restart failed is re-queued
    pub requeue_cooldown: Duration,
    /// Quarantine window as a multiple of `detection_interval`
    pub quarantine_multiplier: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            detection_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            restart_cmd: None,
            restart_wait: Duration::from_secs(10),
            requeue_cooldown: Duration::from_secs(15),
            quarantine_multiplier: 5,
        }
    }
}

impl CoordinatorConfig {
    pub fn quarantine_window(&self) -> Duration {
        self.detection_interval * self.quarantine_multiplier
    }
}

#[derive(Deserialize)]
struct RegisterParams {
    identity: String,
    addr: String,
}

struct CoordinatorState {
    members: Vec<Member>,
    quarantine: Quarantine,
    statuses: HashMap<String, NodeState>,
}

/// Server-side replication coordinator.
///
/// Owns the authoritative live-node set, elects the primary, detects node
/// death by active polling and restarts dead nodes out-of-band. Probe
/// failures are never propagated to callers: the coordinator logs and acts.
///
/// The member list is the single shared structure; the registration endpoint
/// and the probe loop serialize on one mutex around it.
pub struct Coordinator {
    directory: Directory,
    config: CoordinatorConfig,
    transport: TcpTransport,
    state: Arc<Mutex<CoordinatorState>>,
}

impl Coordinator {
    pub fn new(directory: Directory, config: CoordinatorConfig) -> Arc<Self> {
        let quarantine = Quarantine::new(config.quarantine_window());
        Arc::new(Self {
            directory,
            config,
            transport: TcpTransport,
            state: Arc::new(Mutex::new(CoordinatorState {
                members: Vec::new(),
                quarantine,
                statuses: HashMap::new(),
            })),
        })
    }

    /// Adopts nodes already registered in the directory and elects an
    /// initial primary.
    ///
    /// When a previous primary registration exists, the node following it in
    /// the stable order is activated; otherwise the first node is. An empty
    /// directory with a stale primary binding gets the binding cleared.
    pub async fn bootstrap(&self) -> Result<()> {
        let snapshot = self.directory.refresh().await?;
        let mut state = self.state.lock().await;

        let members: Vec<Member> = snapshot
            .nodes
            .iter()
            .map(|node| Member {
                identity: node.identity.clone(),
                addr: node.addr.clone(),
                is_primary: node.is_primary,
            })
            .collect();
        for member in &members {
            state
                .statuses
                .insert(member.identity.clone(), NodeState::Active);
        }
        info!(members = members.len(), "adopted registered nodes");
        state.members = members;

        let previous_primary = state.members.iter().position(|m| m.is_primary);
        let index = match previous_primary {
            Some(i) => {
                info!("activating the node after the previously-registered primary");
                i + 1
            }
            None => 0,
        };
        self.elect_locked(&mut state, index).await;
        Ok(())
    }

    /// Handles one coordinator request.
    pub async fn handle_request(&self, request: Request) -> Result<Response> {
        match request.method.as_str() {
            "node_registered" => {
                let params: RegisterParams = serde_json::from_value(request.args)
                    .map_err(|e| ParkrpcError::InvalidRequest(format!("Bad arguments: {}", e)))?;
                self.register(params.identity, params.addr).await;
                Ok(Response::success(request.id, json!({})))
            }
            "coordinator_members" => {
                let state = self.state.lock().await;
                let members: Vec<_> = state
                    .members
                    .iter()
                    .map(|m| {
                        json!({
                            "identity": m.identity,
                            "addr": m.addr,
                            "is_primary": m.is_primary,
                            "state": format!("{:?}", state.statuses.get(&m.identity).copied().unwrap_or(NodeState::Active)),
                        })
                    })
                    .collect();
                Ok(Response::success(request.id, json!({ "members": members })))
            }
            other => Err(ParkrpcError::InvalidRequest(format!(
                "Unknown coordinator method: {}",
                other
            ))),
        }
    }

    /// Accepts an unsolicited "I just started" registration.
    ///
    /// Any stale entry under the same identity is replaced; if the replaced
    /// entry held the primary role, or the set was empty, the fresh node is
    /// elected.
    pub async fn register(&self, identity: String, addr: String) {
        let mut state = self.state.lock().await;

        state.quarantine.clear(&identity);
        let mut replaced_primary = false;
        state.members.retain(|m| {
            if m.identity == identity {
                replaced_primary |= m.is_primary;
                false
            } else {
                true
            }
        });

        info!(%identity, %addr, "node is now active");
        state.members.push(Member::new(identity.clone(), addr));
        state.statuses.insert(identity, NodeState::Active);

        if replaced_primary || state.members.len() == 1 {
            let index = state.members.len() - 1;
            self.elect_locked(&mut state, index).await;
        }
    }

    /// Elects the member at `index` (wrapping), skipping quarantined
    /// identities. With no electable member the primary name is unbound:
    /// "no primary" is an explicit directory state, not an absence of
    /// action.
    async fn elect_locked(&self, state: &mut CoordinatorState, index: usize) {
        let len = state.members.len();
        let chosen = (0..len)
            .map(|offset| (index + offset) % len)
            .find(|&i| !state.quarantine.contains(&state.members[i].identity));

        let Some(chosen) = chosen else {
            info!("no servers are active; clearing the primary registration");
            for member in &mut state.members {
                member.is_primary = false;
            }
            if let Err(e) = self.directory.unbind(PRIMARY_NAME).await {
                warn!(error = %e, "could not clear the primary registration");
            }
            return;
        };

        for member in &mut state.members {
            member.is_primary = false;
        }
        state.members[chosen].is_primary = true;
        let elected = state.members[chosen].clone();
        info!(identity = %elected.identity, addr = %elected.addr, "setting node as primary");

        if let Err(e) = self.directory.rebind(PRIMARY_NAME, &elected.node_ref()).await {
            warn!(identity = %elected.identity, error = %e, "could not register the new primary");
        }
    }

    /// One probe sweep over the live-node set.
    ///
    /// Returns true when at least one node failed, in which case the caller
    /// should sweep again immediately instead of sleeping.
    pub async fn sweep_once(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock().await;
            state.quarantine.sweep();
        }

        let members = {
            let state = self.state.lock().await;
            state.members.clone()
        };

        let mut any_failure = false;
        for member in members {
            match self.probe(&member.addr).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(identity = %member.identity, error = %e, "node has failed");
                    any_failure = true;
                    self.handle_failure(member).await;
                }
            }
        }
        any_failure
    }

    async fn probe(&self, addr: &str) -> Result<()> {
        let request = Request::new("probe", json!({}));
        let call = self.transport.call(addr, &request);
        let response = tokio::time::timeout(self.config.probe_timeout, call)
            .await
            .map_err(|_| ParkrpcError::Timeout(self.config.probe_timeout.as_millis() as u64))??;
        response.into_result().map(|_| ())
    }

    /// Removes a dead member, unbinds its name, re-elects if it was primary
    /// and kicks off the restart flow.
    async fn handle_failure(self: &Arc<Self>, failed: Member) {
        {
            let mut state = self.state.lock().await;

            // The node may have re-registered (possibly at a new address)
            // while we were probing; leave such an entry alone.
            let position = state
                .members
                .iter()
                .position(|m| m.identity == failed.identity && m.addr == failed.addr);
            let Some(position) = position else {
                return;
            };

            let removed = state.members.remove(position);
            state
                .statuses
                .insert(removed.identity.clone(), NodeState::Failed);
            state.quarantine.mark(&removed.identity);

            if removed.is_primary {
                self.elect_locked(&mut state, position).await;
            }

            if let Err(e) = self.directory.unbind(&removed.identity).await {
                warn!(identity = %removed.identity, error = %e, "could not unbind dead node");
            }

            if self.config.restart_cmd.is_none() {
                // Nothing to restart with; the node stays out until it
                // registers itself again
                state
                    .statuses
                    .insert(removed.identity.clone(), NodeState::Quarantined);
                return;
            }
        }

        if let Some(cmd) = self.config.restart_cmd.clone() {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                coordinator.supervise_restart(failed, cmd).await;
            });
        }
    }

    /// Drives one restart attempt: `Failed → Restarting`, then either the
    /// node comes back (it re-registers itself and turns `Active`), or
    /// `Quarantined` plus a cooldown re-queue so the probe loop retries the
    /// restart indefinitely.
    async fn supervise_restart(self: Arc<Self>, member: Member, cmd: String) {
        {
            let mut state = self.state.lock().await;
            state
                .statuses
                .insert(member.identity.clone(), NodeState::Restarting);
        }

        if run_restart(&cmd, &member, self.config.restart_wait).await {
            // The restarted node announces itself via node_registered
            return;
        }

        {
            let mut state = self.state.lock().await;
            state
                .statuses
                .insert(member.identity.clone(), NodeState::Quarantined);
        }
        info!(
            identity = %member.identity,
            cooldown = ?self.config.requeue_cooldown,
            "restart failed; re-queueing after cooldown"
        );
        tokio::time::sleep(self.config.requeue_cooldown).await;

        let mut state = self.state.lock().await;
        if !state.members.iter().any(|m| m.identity == member.identity) {
            state
                .statuses
                .insert(member.identity.clone(), NodeState::Failed);
            state.members.push(Member {
                is_primary: false,
                ..member
            });
        }
    }

    /// Runs the continuous probe loop. A sweep that saw a failure rolls
    /// straight into the next sweep; quiet sweeps wait out the detection
    /// interval.
    pub async fn run(self: Arc<Self>) {
        loop {
            let any_failure = self.sweep_once().await;
            if !any_failure {
                tokio::time::sleep(self.config.detection_interval).await;
            }
        }
    }

    /// Spawns the probe loop task.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            coordinator.run().await;
        })
    }

    /// Binds the registration endpoint and serves it until the task is
    /// dropped.
    pub async fn serve(
        self: &Arc<Self>,
        bind_addr: &str,
    ) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
        let server = TcpServer::new(bind_addr).await?;
        let addr = server.local_addr()?;
        info!(%addr, "coordinator listening");

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _ = server
                .run_with_handler(move |request| {
                    let coordinator = Arc::clone(&coordinator);
                    async move { coordinator.handle_request(request).await }
                })
                .await;
        });

        Ok((addr, handle))
    }

    /// Current live-node set. Test/diagnostic helper.
    pub async fn members(&self) -> Vec<Member> {
        self.state.lock().await.members.clone()
    }

    /// Per-identity lifecycle states. Test/diagnostic helper.
    pub async fn node_states(&self) -> HashMap<String, NodeState> {
        self.state.lock().await.statuses.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parkrpc_directory::{DirectoryServer, NodeRef};

    async fn start_directory() -> (Directory, tokio::task::JoinHandle<()>) {
        let (addr, handle) = DirectoryServer::new().serve("127.0.0.1:0").await.unwrap();
        (Directory::new(addr.to_string()), handle)
    }

    /// A fake node that answers probes until its task is aborted.
    async fn start_fake_node() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let server = TcpServer::new("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = server
                .run_with_handler(|request| async move {
                    Ok(Response::success(request.id, json!({})))
                })
                .await;
        });
        (addr, handle)
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            detection_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    async fn resolve_primary(directory: &Directory) -> Option<String> {
        match directory.resolve(PRIMARY_NAME).await {
            Ok(node) => Some(node.identity),
            Err(_) => None,
        }
    }

    #[tokio::test]
    async fn test_first_registration_becomes_primary() {
        let (directory, dir_handle) = start_directory().await;
        let coordinator = Coordinator::new(directory.clone(), test_config());

        coordinator
            .register("node-a".to_string(), "127.0.0.1:9001".to_string())
            .await;

        let members = coordinator.members().await;
        assert_eq!(members.len(), 1);
        assert!(members[0].is_primary);
        assert_eq!(resolve_primary(&directory).await.as_deref(), Some("node-a"));

        dir_handle.abort();
    }

    #[tokio::test]
    async fn test_second_registration_stays_backup() {
        let (directory, dir_handle) = start_directory().await;
        let coordinator = Coordinator::new(directory.clone(), test_config());

        coordinator
            .register("node-a".to_string(), "127.0.0.1:9001".to_string())
            .await;
        coordinator
            .register("node-b".to_string(), "127.0.0.1:9002".to_string())
            .await;

        assert_eq!(resolve_primary(&directory).await.as_deref(), Some("node-a"));
        let members = coordinator.members().await;
        assert!(!members.iter().find(|m| m.identity == "node-b").unwrap().is_primary);

        dir_handle.abort();
    }

    #[tokio::test]
    async fn test_reregistration_of_primary_reelects_fresh_entry() {
        let (directory, dir_handle) = start_directory().await;
        let coordinator = Coordinator::new(directory.clone(), test_config());

        coordinator
            .register("node-a".to_string(), "127.0.0.1:9001".to_string())
            .await;
        coordinator
            .register("node-b".to_string(), "127.0.0.1:9002".to_string())
            .await;
        // The primary restarts at a new address and announces itself
        coordinator
            .register("node-a".to_string(), "127.0.0.1:9005".to_string())
            .await;

        let members = coordinator.members().await;
        assert_eq!(members.len(), 2);
        let node_a = members.iter().find(|m| m.identity == "node-a").unwrap();
        assert_eq!(node_a.addr, "127.0.0.1:9005");
        assert!(node_a.is_primary);

        dir_handle.abort();
    }

    #[tokio::test]
    async fn test_sweep_removes_dead_node_and_reelects() {
        let (directory, dir_handle) = start_directory().await;
        let coordinator = Coordinator::new(directory.clone(), test_config());

        let (addr_a, node_a) = start_fake_node().await;
        let (addr_b, node_b) = start_fake_node().await;
        coordinator
            .register("node-a".to_string(), addr_a.to_string())
            .await;
        coordinator
            .register("node-b".to_string(), addr_b.to_string())
            .await;
        directory
            .bind("node-a", &NodeRef::new("node-a", addr_a.to_string()))
            .await
            .unwrap();
        directory
            .bind("node-b", &NodeRef::new("node-b", addr_b.to_string()))
            .await
            .unwrap();
        assert_eq!(resolve_primary(&directory).await.as_deref(), Some("node-a"));

        // Kill the primary
        node_a.abort();
        let any_failure = coordinator.sweep_once().await;
        assert!(any_failure);

        let members = coordinator.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].identity, "node-b");
        assert!(members[0].is_primary);
        assert_eq!(resolve_primary(&directory).await.as_deref(), Some("node-b"));

        // The dead node's own name is gone from the directory
        assert!(directory.resolve("node-a").await.is_err());

        // And without a restart command it parks in quarantine
        let states = coordinator.node_states().await;
        assert_eq!(states["node-a"], NodeState::Quarantined);

        node_b.abort();
        dir_handle.abort();
    }

    #[tokio::test]
    async fn test_last_node_death_unbinds_primary() {
        let (directory, dir_handle) = start_directory().await;
        let coordinator = Coordinator::new(directory.clone(), test_config());

        let (addr_a, node_a) = start_fake_node().await;
        coordinator
            .register("node-a".to_string(), addr_a.to_string())
            .await;
        assert!(resolve_primary(&directory).await.is_some());

        node_a.abort();
        coordinator.sweep_once().await;

        assert!(coordinator.members().await.is_empty());
        assert_eq!(resolve_primary(&directory).await, None);

        dir_handle.abort();
    }

    #[tokio::test]
    async fn test_bootstrap_adopts_directory_and_elects_successor() {
        let (directory, dir_handle) = start_directory().await;

        directory
            .bind("node-a", &NodeRef::new("node-a", "127.0.0.1:9001"))
            .await
            .unwrap();
        directory
            .bind("node-b", &NodeRef::new("node-b", "127.0.0.1:9002"))
            .await
            .unwrap();
        directory
            .rebind(PRIMARY_NAME, &NodeRef::new("node-a", "127.0.0.1:9001"))
            .await
            .unwrap();

        let coordinator = Coordinator::new(directory.clone(), test_config());
        coordinator.bootstrap().await.unwrap();

        // node-a was primary before; its successor in order takes over
        assert_eq!(resolve_primary(&directory).await.as_deref(), Some("node-b"));
        assert_eq!(coordinator.members().await.len(), 2);

        dir_handle.abort();
    }

    #[tokio::test]
    async fn test_registration_endpoint() {
        let (directory, dir_handle) = start_directory().await;
        let coordinator = Coordinator::new(directory.clone(), test_config());
        let (addr, serve_handle) = coordinator.serve("127.0.0.1:0").await.unwrap();

        let request = Request::new(
            "node_registered",
            json!({"identity": "node-a", "addr": "127.0.0.1:9001"}),
        );
        let response = TcpTransport.call(&addr.to_string(), &request).await.unwrap();
        assert!(response.success);
        assert_eq!(coordinator.members().await.len(), 1);

        serve_handle.abort();
        dir_handle.abort();
    }
}
