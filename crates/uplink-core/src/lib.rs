//! uplink-core: shared protocol library for the uplink device daemon.
//!
//! Provides the error taxonomy, JSON-RPC 2.0 envelopes with inbound
//! classification, and fixed-size wire framing for outbound messages.

pub mod codec;
pub mod error;
pub mod jsonrpc;

// Re-export commonly used items at crate root.
pub use codec::{chunk_message, Chunk, WS_FRAME_SIZE};
pub use error::{UplinkError, UplinkResult};
pub use jsonrpc::{classify, Inbound, Reply, Request, Response, RpcError};
