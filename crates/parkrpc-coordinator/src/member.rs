use parkrpc_directory::NodeRef;

/// Lifecycle of a node as seen by the coordinator.
///
/// `Active → Failed → Restarting → Active` in the good case; a node whose
/// restarts keep failing parks in `Quarantined` until its cooldown expires
/// and it is re-queued (or until it registers itself again).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Active,
    Failed,
    Restarting,
    Quarantined,
}

/// One entry in the coordinator's live-node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub identity: String,
    pub addr: String,
    pub is_primary: bool,
}

impl Member {
    pub fn new(identity: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            addr: addr.into(),
            is_primary: false,
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.identity.clone(), self.addr.clone())
    }
}
