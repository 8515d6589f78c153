//! Fault-tolerant client for the parkrpc system.
//!
//! [`FailoverManager`] wraps every remote lot operation: it classifies
//! failures, transparently re-homes to a working node through its
//! background health-monitor task, and reuses the same sequence
//! number across retries of one logical operation so the server-side ledger
//! can deduplicate redeliveries. Callers see domain errors and — only when
//! no primary is registered at all and give-up is permitted — a single
//! `ServiceUnavailable`; never a raw transport failure.
//!
//! The manager serves one foreground caller at a time; synchronize
//! externally if several tasks must share one instance.

pub mod config;
pub mod failover;
mod monitor;
pub mod session;

pub use config::FailoverConfig;
pub use failover::{FailoverManager, Operation};
pub use session::NodeSession;
