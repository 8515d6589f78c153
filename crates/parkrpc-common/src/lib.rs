//! Shared protocol types and transport for the parkrpc system.
//!
//! # Overview
//!
//! parkrpc is a primary-backup fault-tolerant RPC layer for a distributed
//! parking-lot service. This crate contains the infrastructure shared by
//! every process role:
//!
//! - **Protocol Layer**: `Request`/`Response` types, the error taxonomy and
//!   the wire error codes the failover layer classifies on
//! - **Transport Layer**: TCP communication with length-prefixed JSON frames
//!
//! # Wire protocol
//!
//! - **Transport**: TCP
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB
//!
//! # Example
//!
//! ```no_run
//! use parkrpc_common::{Request, Response};
//! use serde_json::json;
//!
//! let request = Request::new("enter_lot", json!({"client_id": 1, "seq": 1, "lot": 2}))
//!     .with_timeout(5000);
//! let response = Response::success(request.id, json!({"levels": [1, 2, 3]}));
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
