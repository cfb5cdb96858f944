//! WebSocket close codes sent on the tunnel socket.
//!
//! Numeric values live in the private-use close-code space (4000–4999)
//! and are an interface contract: both endpoints must agree on them.

/// Any other internal error; the close reason carries a human-readable cause.
pub const UNEXPECTED: u16 = 4000;

/// The gateway referenced by the admission token no longer exists.
pub const GATEWAY_CLOSED: u16 = 4001;

/// The demuxer produced a frame with an unknown type tag.
pub const INVALID_FRAME_TYPE: u16 = 4002;
