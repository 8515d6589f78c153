//! Transport layer: TCP framing and the JSON codec.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one fresh connection per request on the client side
//! - **Codec**: JSON serialization for protocol messages
//! - **Wire Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//!
//! All transport implementations enforce a maximum message size of 100 MB
//! to prevent memory exhaustion.

pub mod codec;
pub mod tcp;
pub mod tcp_server;

pub use codec::JsonCodec;
pub use tcp::TcpTransport;
pub use tcp_server::TcpServer;
