use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::record::NodeRecord;

/// Blackout bookkeeping for recently failed nodes.
///
/// A node marked faulty is excluded from candidacy until `window` has
/// elapsed since its *first* failure; repeated failures inside the window do
/// not extend it. Expired entries are swept lazily on each refresh rather
/// than by a timer. Matching is by stable identity, so a restarted node
/// whose address changed rejoins as soon as the window expires (or sooner,
/// if it is explicitly cleared on re-registration).
///
/// Both the client-side health monitor and the coordinator keep their own
/// independent instance of this type.
#[derive(Debug)]
pub struct Quarantine {
    window: Duration,
    entries: HashMap<String, Instant>,
}

impl Quarantine {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Records a failure. The first-failure timestamp is kept on repeats.
    pub fn mark(&mut self, identity: &str) {
        self.entries
            .entry(identity.to_string())
            .or_insert_with(Instant::now);
        debug!(identity, "node quarantined");
    }

    /// Removes a node from quarantine, e.g. because it explicitly
    /// re-registered.
    pub fn clear(&mut self, identity: &str) {
        self.entries.remove(identity);
    }

    /// Drops entries whose blackout window has expired.
    pub fn sweep(&mut self) {
        let window = self.window;
        self.entries
            .retain(|_, first_failure| first_failure.elapsed() < window);
    }

    /// True while the node's blackout window is still open.
    pub fn contains(&self, identity: &str) -> bool {
        self.entries
            .get(identity)
            .is_some_and(|first_failure| first_failure.elapsed() < self.window)
    }

    /// Filters quarantined nodes out of a candidate list.
    pub fn filter_candidates(&self, nodes: Vec<NodeRecord>) -> Vec<NodeRecord> {
        nodes
            .into_iter()
            .filter(|n| !self.contains(&n.identity))
            .collect()
    }

    #[cfg(test)]
    fn mark_at(&mut self, identity: &str, first_failure: Instant) {
        self.entries.entry(identity.to_string()).or_insert(first_failure);
    }
}
