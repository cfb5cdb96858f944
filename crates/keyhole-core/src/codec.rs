//! Self-delimiting frame codec for the tunnel wire.
//!
//! Wire format, identical in both directions:
//!
//! ```text
//! rpc_frame  := 0x01 | u32be payload_len | payload
//! chan_frame := 0x02 | flags u8 | quid_len u8 | quid utf8 | u32be payload_len | payload
//! flags bit0 = binary
//! ```
//!
//! The muxer is a pure function `Frame -> bytes`; the demuxer is an
//! incremental parser that tolerates chunk boundaries falling anywhere
//! within a frame. Neither side blocks.

use crate::error::{TunnelError, TunnelResult};
use crate::frame::Frame;

/// Type tag for an RPC envelope frame.
pub const TAG_RPC: u8 = 0x01;
/// Type tag for a data-channel frame.
pub const TAG_DATA_CHANNEL: u8 = 0x02;

const FLAG_BINARY: u8 = 0x01;

/// Maximum payload carried by a single frame (1 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 1_048_576;

/// Encode one frame into a contiguous wire buffer.
///
/// Fails with [`TunnelError::InvalidFrame`] on an empty or oversized quid,
/// or a payload above [`MAX_FRAME_PAYLOAD`].
pub fn encode_frame(frame: &Frame) -> TunnelResult<Vec<u8>> {
    match frame {
        Frame::Rpc { payload } => {
            check_payload(payload.len())?;
            let mut buf = Vec::with_capacity(5 + payload.len());
            buf.push(TAG_RPC);
            buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(payload);
            Ok(buf)
        }
        Frame::DataChannel {
            quid,
            binary,
            payload,
        } => {
            if quid.is_empty() {
                return Err(TunnelError::InvalidFrame("empty quid".into()));
            }
            if quid.len() > u8::MAX as usize {
                return Err(TunnelError::InvalidFrame(format!(
                    "quid too long: {} bytes",
                    quid.len()
                )));
            }
            check_payload(payload.len())?;
            let mut buf = Vec::with_capacity(7 + quid.len() + payload.len());
            buf.push(TAG_DATA_CHANNEL);
            buf.push(if *binary { FLAG_BINARY } else { 0 });
            buf.push(quid.len() as u8);
            buf.extend_from_slice(quid.as_bytes());
            buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            buf.extend_from_slice(payload);
            Ok(buf)
        }
    }
}

fn check_payload(len: usize) -> TunnelResult<()> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(TunnelError::InvalidFrame(format!(
            "payload too large: {len} bytes (max {MAX_FRAME_PAYLOAD})"
        )));
    }
    Ok(())
}

/// Streaming frame decoder: accumulates transport chunks and yields whole
/// frames.
///
/// Any parse failure is fatal to the owning session; the decoder makes no
/// attempt to resynchronize.
#[derive(Debug, Default)]
pub struct Demuxer {
    buf: Vec<u8>,
}

impl Demuxer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete frames.
    pub fn feed(&mut self, data: &[u8]) -> TunnelResult<Vec<Frame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match self.parse_one()? {
                Some((frame, consumed)) => {
                    self.buf.drain(..consumed);
                    frames.push(frame);
                }
                None => break,
            }
        }

        Ok(frames)
    }

    /// Number of bytes buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to parse one frame from the front of the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    fn parse_one(&self) -> TunnelResult<Option<(Frame, usize)>> {
        let buf = &self.buf;
        let Some(&tag) = buf.first() else {
            return Ok(None);
        };

        match tag {
            TAG_RPC => {
                let Some(len) = read_len(buf, 1)? else {
                    return Ok(None);
                };
                let end = 5 + len;
                if buf.len() < end {
                    return Ok(None);
                }
                let payload = buf[5..end].to_vec();
                Ok(Some((Frame::Rpc { payload }, end)))
            }
            TAG_DATA_CHANNEL => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                let flags = buf[1];
                let quid_len = buf[2] as usize;
                if quid_len == 0 {
                    return Err(TunnelError::MalformedFrame("zero-length quid".into()));
                }
                let len_at = 3 + quid_len;
                let Some(len) = read_len(buf, len_at)? else {
                    return Ok(None);
                };
                let end = len_at + 4 + len;
                if buf.len() < end {
                    return Ok(None);
                }
                let quid = std::str::from_utf8(&buf[3..3 + quid_len])
                    .map_err(|_| TunnelError::MalformedFrame("quid is not utf-8".into()))?
                    .to_string();
                let payload = buf[len_at + 4..end].to_vec();
                Ok(Some((
                    Frame::DataChannel {
                        quid,
                        binary: flags & FLAG_BINARY != 0,
                        payload,
                    },
                    end,
                )))
            }
            other => Err(TunnelError::UnknownFrameType(other)),
        }
    }
}

/// Read a u32 length at `at`, rejecting oversized frames before the
/// payload arrives.
fn read_len(buf: &[u8], at: usize) -> TunnelResult<Option<usize>> {
    if buf.len() < at + 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(TunnelError::MalformedFrame(format!(
            "payload length {len} exceeds {MAX_FRAME_PAYLOAD}"
        )));
    }
    Ok(Some(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(payload: &[u8]) -> Frame {
        Frame::Rpc {
            payload: payload.to_vec(),
        }
    }

    fn chan(quid: &str, binary: bool, payload: &[u8]) -> Frame {
        Frame::DataChannel {
            quid: quid.to_string(),
            binary,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn round_trip_rpc() {
        let frame = rpc(b"envelope bytes");
        let wire = encode_frame(&frame).unwrap();
        let mut demux = Demuxer::new();
        let out = demux.feed(&wire).unwrap();
        assert_eq!(out, vec![frame]);
        assert_eq!(demux.pending(), 0);
    }

    #[test]
    fn round_trip_data_channel() {
        for binary in [true, false] {
            let frame = chan("a1b2c3", binary, &[0, 1, 2, 255]);
            let wire = encode_frame(&frame).unwrap();
            let out = Demuxer::new().feed(&wire).unwrap();
            assert_eq!(out, vec![frame]);
        }
    }

    #[test]
    fn empty_payload_frames() {
        let frames = vec![rpc(b""), chan("q", true, b"")];
        for frame in frames {
            let wire = encode_frame(&frame).unwrap();
            assert_eq!(Demuxer::new().feed(&wire).unwrap(), vec![frame]);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let frame = chan("deadbeef", true, b"chunk boundaries anywhere");
        let wire = encode_frame(&frame).unwrap();
        let mut demux = Demuxer::new();

        for b in &wire[..wire.len() - 1] {
            assert!(demux.feed(std::slice::from_ref(b)).unwrap().is_empty());
        }
        let out = demux.feed(&wire[wire.len() - 1..]).unwrap();
        assert_eq!(out, vec![frame]);
    }

    #[test]
    fn multiple_frames_one_chunk() {
        let frames = vec![rpc(b"one"), chan("q1", false, b"two"), rpc(b"three")];
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend(encode_frame(f).unwrap());
        }
        assert_eq!(Demuxer::new().feed(&wire).unwrap(), frames);
    }

    #[test]
    fn split_across_frame_boundary() {
        let a = rpc(b"first");
        let b = chan("zz", true, b"second");
        let mut wire = encode_frame(&a).unwrap();
        wire.extend(encode_frame(&b).unwrap());

        let mut demux = Demuxer::new();
        let cut = wire.len() - 3;
        let mut out = demux.feed(&wire[..cut]).unwrap();
        out.extend(demux.feed(&wire[cut..]).unwrap());
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn unknown_tag_fails() {
        let err = Demuxer::new().feed(&[0x7f, 0, 0]).unwrap_err();
        assert!(matches!(err, TunnelError::UnknownFrameType(0x7f)));
    }

    #[test]
    fn zero_quid_fails() {
        // tag, flags, quid_len = 0
        let err = Demuxer::new().feed(&[TAG_DATA_CHANNEL, 0, 0]).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn non_utf8_quid_fails() {
        let mut wire = vec![TAG_DATA_CHANNEL, 0, 2, 0xff, 0xfe];
        wire.extend_from_slice(&0u32.to_be_bytes());
        let err = Demuxer::new().feed(&wire).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn oversized_length_rejected_before_payload() {
        let mut wire = vec![TAG_RPC];
        wire.extend_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_be_bytes());
        let err = Demuxer::new().feed(&wire).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedFrame(_)));
    }

    #[test]
    fn mux_rejects_empty_quid() {
        let err = encode_frame(&chan("", true, b"x")).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidFrame(_)));
    }

    #[test]
    fn mux_rejects_long_quid() {
        let quid = "q".repeat(256);
        let err = encode_frame(&chan(&quid, true, b"x")).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidFrame(_)));
    }

    #[test]
    fn mux_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let err = encode_frame(&rpc(&payload)).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidFrame(_)));
    }
}
