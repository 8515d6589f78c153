//! Backend node for the parkrpc system.
//!
//! A node serves the session and lot operations over the common transport,
//! backed by an in-memory [`LotStore`] that doubles as the per-client
//! idempotency ledger: every state-changing operation carries a sequence
//! number, and a redelivered `(client, seq)` pair is answered from the
//! ledger without re-applying its effect. That contract is what makes the
//! client's at-least-once retries safe.
//!
//! The admin surface (`flush_perf_log`, `terminate_*`,
//! `inject_store_failure`) exists for ops and fault-injection tooling; the
//! fault-tolerance protocol itself never calls it.

pub mod node;
pub mod perf;
pub mod store;

pub use node::LotNode;
pub use perf::PerfLog;
pub use store::{ClientRow, LotSpec, LotStore, ENTRY_LEVEL};
