use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use parkrpc_common::ParkrpcError;
use parkrpc_directory::{Directory, DirectorySnapshot, NodeRecord, Quarantine};

use crate::config::FailoverConfig;
use crate::session::NodeSession;

/// Shared binding state between the failover manager and its monitor.
///
/// Mutated only under the mutex and always swapped wholesale; `last_seq` is
/// owned by the manager, everything else by whichever side rebinds.
#[derive(Debug, Default)]
pub(crate) struct ClientBinding {
    pub node: Option<Arc<NodeSession>>,
    pub client_id: Option<u64>,
    pub last_seq: u64,
    pub system_down: bool,
}

/// How one election-assist cycle ended.
pub(crate) enum RecoverOutcome {
    /// A node is bound; the caller may retry.
    Rebound,
    /// No node could be bound; the caller decides whether to give up.
    Failed,
    /// Identity mismatch; the session is unrecoverable.
    Fatal(ParkrpcError),
}

/// A caller's urgent reconnect request, answered through the enclosed
/// channel once the monitor has run (or skipped) an election-assist cycle.
pub(crate) struct RecoverRequest {
    pub faulty: Option<String>,
    pub done: oneshot::Sender<RecoverOutcome>,
}

/// Work the monitor owes at the top of its next loop pass.
enum Pending {
    Caller(RecoverRequest),
    SelfDetected { faulty: Option<String> },
}

/// Background health-monitoring and failover-trigger loop.
///
/// One iteration: serve an urgent fault if one is flagged; otherwise
/// refresh the directory (recording whether the system is down and sweeping
/// expired quarantine entries), serially probe every known node, quarantine
/// failures, and flag an urgent fault when the bound primary failed or
/// could not be confirmed. Between iterations the task waits out the
/// detection interval, woken early by a caller request or shutdown.
pub(crate) struct HealthMonitor {
    config: FailoverConfig,
    directory: Directory,
    binding: Arc<Mutex<ClientBinding>>,
    quarantine: Quarantine,
    known: Vec<NodeRecord>,
    recover_rx: mpsc::Receiver<RecoverRequest>,
    shutdown_rx: watch::Receiver<bool>,
    pending: Option<Pending>,
    recoveries: Arc<std::sync::atomic::AtomicU64>,
}

impl HealthMonitor {
    /// Spawns the monitor task. The initial connection outcome is reported
    /// through `startup_tx` before the periodic loop starts.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        config: FailoverConfig,
        directory: Directory,
        binding: Arc<Mutex<ClientBinding>>,
        recover_rx: mpsc::Receiver<RecoverRequest>,
        shutdown_rx: watch::Receiver<bool>,
        startup_tx: oneshot::Sender<bool>,
        recoveries: Arc<std::sync::atomic::AtomicU64>,
    ) -> tokio::task::JoinHandle<()> {
        let quarantine = Quarantine::new(config.quarantine_window());
        let monitor = Self {
            config,
            directory,
            binding,
            quarantine,
            known: Vec::new(),
            recover_rx,
            shutdown_rx,
            pending: None,
            recoveries,
        };
        tokio::spawn(async move {
            monitor.run(startup_tx).await;
        })
    }

    async fn run(mut self, startup_tx: oneshot::Sender<bool>) {
        let connected = self.initial_connection().await;
        let _ = startup_tx.send(connected);
        if !connected {
            return;
        }

        loop {
            if *self.shutdown_rx.borrow() {
                return;
            }

            // 1. An urgent fault takes the whole iteration
            if self.pending.is_none() {
                match self.recover_rx.try_recv() {
                    Ok(req) => self.pending = Some(Pending::Caller(req)),
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }
            if let Some(pending) = self.pending.take() {
                self.handle_pending(pending).await;
                continue;
            }

            // 2. Refresh the candidate set; a failed refresh keeps the
            // stale list, which the probes below will prune anyway
            match self.directory.refresh().await {
                Ok(snapshot) => {
                    self.note_system_state(&snapshot);
                    self.quarantine.sweep();
                    self.known = self.quarantine.filter_candidates(snapshot.nodes);
                }
                Err(e) => warn!(error = %e, "directory refresh failed"),
            }

            // 3. Serially probe every known node
            let bound = self.bound_identity();
            let mut primary_confirmed = false;
            let mut backup_fault = false;
            let mut failed_primary = None;
            let mut i = 0;
            while i < self.known.len() {
                // A caller fault preempts the sweep
                if let Ok(req) = self.recover_rx.try_recv() {
                    self.pending = Some(Pending::Caller(req));
                    break;
                }

                let node = self.known[i].clone();
                let session = NodeSession::new(node.clone(), self.config.call_timeout);
                match session.probe(self.config.probe_timeout).await {
                    Ok(()) => {
                        if Some(&node.identity) == bound.as_ref() {
                            primary_confirmed = true;
                        }
                        i += 1;
                    }
                    Err(e) => {
                        warn!(identity = %node.identity, error = %e, "node failed its probe");
                        self.quarantine.mark(&node.identity);
                        self.known.remove(i);
                        if Some(&node.identity) == bound.as_ref() {
                            failed_primary = Some(node.identity.clone());
                        } else {
                            backup_fault = true;
                        }
                    }
                }
            }
            if self.pending.is_some() {
                continue;
            }

            // 4. The bound node failed, or vanished from the probed set:
            // flag the fault for the next pass
            if failed_primary.is_some() {
                self.pending = Some(Pending::SelfDetected {
                    faulty: failed_primary,
                });
                continue;
            }
            if !primary_confirmed && !self.known.is_empty() {
                self.pending = Some(Pending::SelfDetected { faulty: None });
                continue;
            }

            // 5. Wait out the detection interval; skip the wait after a
            // backup died so the sweep resumes immediately
            if !backup_fault {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.detection_interval) => {}
                    req = self.recover_rx.recv() => match req {
                        Some(req) => self.pending = Some(Pending::Caller(req)),
                        None => return,
                    },
                    _ = self.shutdown_rx.changed() => return,
                }
            }
        }
    }

    async fn handle_pending(&mut self, pending: Pending) {
        match pending {
            Pending::Caller(req) => {
                // A previous cycle may already have rebound us away from the
                // node this caller saw fail; if so there is nothing to do
                if let (Some(bound), Some(faulty)) = (self.bound_identity(), req.faulty.as_ref()) {
                    if bound != *faulty {
                        let _ = req.done.send(RecoverOutcome::Rebound);
                        return;
                    }
                }
                let outcome = self.connect_to_any(req.faulty).await;
                let _ = req.done.send(outcome);
            }
            Pending::SelfDetected { faulty } => {
                // Best effort; a failure here resurfaces on the next sweep
                let _ = self.connect_to_any(faulty).await;
            }
        }
    }

    /// Initial bind. Under never-give-up every reconnection attempt after
    /// the first is preceded by the recovery backoff.
    async fn initial_connection(&mut self) -> bool {
        loop {
            match self.connect_to_any(None).await {
                RecoverOutcome::Rebound => return true,
                RecoverOutcome::Fatal(_) => return false,
                RecoverOutcome::Failed => {}
            }
            if !self.config.never_give_up || *self.shutdown_rx.borrow() {
                return false;
            }
            if !self.config.recovery_timeout.is_zero() {
                tokio::time::sleep(self.config.recovery_timeout).await;
            }
        }
    }

    /// Election-assist: bind to any registered node, chosen uniformly at
    /// random, resuming the existing session when one exists.
    ///
    /// The node most recently deemed faulty is quarantined first. An empty
    /// candidate list triggers a directory refresh; an unreachable
    /// directory, or an empty list after refresh, reports failure and
    /// leaves the give-up decision to the caller.
    async fn connect_to_any(&mut self, faulty: Option<String>) -> RecoverOutcome {
        self.recoveries
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let host = self.config.host_id.clone();

        if let Some(faulty) = &faulty {
            self.quarantine.mark(faulty);
            self.known.retain(|n| n.identity != *faulty);
        }

        loop {
            if self.known.is_empty() {
                match self.directory.refresh().await {
                    Ok(snapshot) => {
                        self.note_system_state(&snapshot);
                        self.quarantine.sweep();
                        self.known = self.quarantine.filter_candidates(snapshot.nodes);
                    }
                    Err(e) => {
                        warn!(error = %e, "directory is not accessible");
                        return RecoverOutcome::Failed;
                    }
                }
                if self.known.is_empty() {
                    return RecoverOutcome::Failed;
                }
            }

            let index = if self.known.len() == 1 {
                0
            } else {
                rand::thread_rng().gen_range(0..self.known.len())
            };
            let candidate = self.known[index].clone();
            let session = Arc::new(NodeSession::new(
                candidate.clone(),
                self.config.call_timeout,
            ));

            let client_id = self.binding.lock().unwrap().client_id;
            let bind_result = match client_id {
                Some(id) => session.resume_session(id, &host).await,
                None => session.create_session(&host).await,
            };

            match bind_result {
                Ok(new_id) => {
                    info!(identity = %candidate.identity, "server successfully obtained");
                    let mut binding = self.binding.lock().unwrap();
                    binding.node = Some(session);
                    binding.client_id = Some(new_id);
                    return RecoverOutcome::Rebound;
                }
                Err(e @ ParkrpcError::UnknownClient(_)) => {
                    error!("server does not remember us; we cannot continue");
                    self.binding.lock().unwrap().node = None;
                    return RecoverOutcome::Fatal(e);
                }
                Err(e) if e.is_retryable() => {
                    warn!(identity = %candidate.identity, error = %e, "candidate failed; trying another server");
                    self.quarantine.mark(&candidate.identity);
                    self.known.remove(index);
                }
                Err(e) => {
                    error!(error = %e, "unexpected error while binding a server");
                    return RecoverOutcome::Failed;
                }
            }
        }
    }

    fn note_system_state(&self, snapshot: &DirectorySnapshot) {
        let mut binding = self.binding.lock().unwrap();
        binding.system_down = !snapshot.primary_registered;
    }

    fn bound_identity(&self) -> Option<String> {
        self.binding
            .lock()
            .unwrap()
            .node
            .as_ref()
            .map(|session| session.identity().to_string())
    }
}
