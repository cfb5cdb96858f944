//! keyhole-server: ingress side of the keyhole tunnel.
//!
//! Accepts authorized tunneled clients at `/tun`, rents each one a bounded
//! gateway (a listener on a leased port presenting the client to the rest
//! of the overlay), and forwards frames between the two.

pub mod config;
pub mod gateway;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use gateway::Gateway;
pub use server::{GatewayGrant, ServerEvent, TunnelServer};
