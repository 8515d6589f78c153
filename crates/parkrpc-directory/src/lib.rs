//! Naming and discovery for parkrpc.
//!
//! Three pieces live here:
//!
//! - [`DirectoryServer`] — the in-memory naming service itself, serving
//!   `dir_list/dir_resolve/dir_bind/dir_rebind/dir_unbind` over the common
//!   transport. Nodes bind their identity here; the coordinator binds the
//!   well-known [`PRIMARY_NAME`].
//! - [`Directory`] — the client adapter used by everyone else:
//!   refresh-on-demand, wholesale snapshots, whole-refresh retry on
//!   transient failures.
//! - [`Quarantine`] — blackout bookkeeping over stable node identities,
//!   instantiated independently by the health monitor and the coordinator.

pub mod client;
pub mod quarantine;
pub mod record;
pub mod server;

pub use client::Directory;
pub use quarantine::Quarantine;
pub use record::{DirectorySnapshot, NodeRecord, NodeRef, PRIMARY_NAME};
pub use server::DirectoryServer;
