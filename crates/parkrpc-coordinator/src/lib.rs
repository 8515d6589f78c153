//! Replication coordinator for the parkrpc system.
//!
//! The coordinator owns the authoritative live-node set and the primary
//! election. Nodes announce themselves with `node_registered`; a continuous
//! probe loop polls every member at the detection interval, and a node that
//! fails its probe is removed, unbound from the directory, replaced as
//! primary when it held the role, and restarted out-of-band.
//!
//! Election deliberately stays a cheap heuristic: the node following the
//! failed one in stable order, wrapping to the front. Any live node is an
//! acceptable primary; clients converge through the directory either way.

pub mod coordinator;
pub mod member;
pub mod restart;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use member::{Member, NodeState};
