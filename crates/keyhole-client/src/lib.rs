//! keyhole-client: renter side of the keyhole tunnel.
//!
//! Connects outbound to a tunnel server, decodes the multiplexed frame
//! stream, and bridges it to loopback endpoints: RPC envelopes are POSTed
//! to a local HTTP endpoint, data-channel frames fan out to per-quid
//! loopback WebSockets.

pub mod client;

mod channels;
mod rpc;

pub use client::{ClientConfig, ClientEvent, ReadyState, TunnelClient};
