//! uplinkd: remote device-management daemon.
//!
//! Holds one JSON-RPC control channel open to the cloud and serves it with
//! uploads, a pty-backed remote shell, PIN access control, log and stat
//! forwarding, and a signaling relay for the media pipeline.

pub mod bus;
pub mod channel;
pub mod config;
pub mod context;
pub mod device;
pub mod forward;
pub mod identity;
pub mod params;
pub mod pin;
pub mod rpc;
pub mod shell;
pub mod signal;
pub mod signaling;
pub mod supervisor;
pub mod upload;
