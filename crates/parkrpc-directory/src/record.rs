use serde::{Deserialize, Serialize};

/// Well-known directory name under which the current primary is bound.
pub const PRIMARY_NAME: &str = "primary";

/// A name-to-node binding as stored by the directory service.
///
/// `identity` is the stable key for a node: it survives restarts and
/// address changes, so quarantine bookkeeping matches on it rather than on
/// `addr`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRef {
    pub identity: String,
    pub addr: String,
}

impl NodeRef {
    pub fn new(identity: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            addr: addr.into(),
        }
    }
}

/// One candidate node as seen in a directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// Stable node key, independent of the current network address
    pub identity: String,
    /// Directory name the node is bound under
    pub name: String,
    /// Current network address
    pub addr: String,
    /// True when the primary binding resolves to this node
    pub is_primary: bool,
}

/// A wholesale view of the directory at one refresh.
///
/// Snapshots are immutable values: the monitor and the coordinator replace
/// them in full on every refresh and never mutate individual records, so
/// readers cannot observe a half-updated node set.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    /// All registered candidate nodes (the primary binding itself excluded)
    pub nodes: Vec<NodeRecord>,
    /// Whether a primary binding exists at all ("system down" when false)
    pub primary_registered: bool,
    /// Identity of the node the primary binding resolves to
    pub primary_identity: Option<String>,
}

impl DirectorySnapshot {
    /// Looks a node up by its stable identity.
    pub fn node(&self, identity: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.identity == identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ref_round_trip() {
        let node = NodeRef::new("node-alpha-9001", "127.0.0.1:9001");
        let json = serde_json::to_string(&node).unwrap();
        let decoded: NodeRef = serde_json::from_str(&json).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn test_snapshot_lookup_by_identity() {
        let snapshot = DirectorySnapshot {
            nodes: vec![
                NodeRecord {
                    identity: "node-a".to_string(),
                    name: "node-a".to_string(),
                    addr: "127.0.0.1:9001".to_string(),
                    is_primary: true,
                },
                NodeRecord {
                    identity: "node-b".to_string(),
                    name: "node-b".to_string(),
                    addr: "127.0.0.1:9002".to_string(),
                    is_primary: false,
                },
            ],
            primary_registered: true,
            primary_identity: Some("node-a".to_string()),
        };

        assert_eq!(snapshot.node("node-b").unwrap().addr, "127.0.0.1:9002");
        assert!(snapshot.node("node-c").is_none());
    }
}
