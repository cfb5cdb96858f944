//! keyhole-core: Shared protocol library for the keyhole tunnel.
//!
//! Provides the tunnel frame model, the muxer/demuxer codec, close codes,
//! error types, and entrance-token minting. Contains no I/O; both the
//! server and the client build their session loops on top of it.

pub mod close_code;
pub mod codec;
pub mod error;
pub mod frame;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{encode_frame, Demuxer, MAX_FRAME_PAYLOAD};
pub use error::{TunnelError, TunnelResult};
pub use frame::{ChannelClose, Frame};
pub use token::{entrance_token, mint_quid};
