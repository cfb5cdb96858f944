use serde::{Deserialize, Serialize};

/// One typed message on the multiplexed tunnel wire.
///
/// The payloads are opaque at this layer: RPC envelope deserialization and
/// data-channel stream semantics belong to the collaborators above the
/// codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An opaque RPC envelope, forwarded byte-for-byte.
    Rpc { payload: Vec<u8> },
    /// A data-channel payload tagged with its session id.
    ///
    /// The `quid` is caller-chosen, preserved end-to-end without
    /// interpretation. `binary` distinguishes binary from text payloads on
    /// the far socket.
    DataChannel {
        quid: String,
        binary: bool,
        payload: Vec<u8>,
    },
}

impl Frame {
    /// The quid of a data-channel frame, if any.
    pub fn quid(&self) -> Option<&str> {
        match self {
            Frame::Rpc { .. } => None,
            Frame::DataChannel { quid, .. } => Some(quid),
        }
    }
}

/// Terminal payload of a data-channel session.
///
/// When the socket behind a quid closes, the last frame emitted for that
/// quid carries this structure as JSON with `binary = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClose {
    pub code: u16,
    pub message: String,
}

impl ChannelClose {
    /// Encode as the terminal frame for `quid`.
    pub fn into_frame(self, quid: String) -> Frame {
        let payload = serde_json::to_vec(&self).unwrap_or_default();
        Frame::DataChannel {
            quid,
            binary: false,
            payload,
        }
    }
}
