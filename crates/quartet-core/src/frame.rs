//! Frame descriptor and frame types.
//!
//! Every message on a connection is one frame: a fixed-size descriptor plus an
//! optional payload. The descriptor carries everything the demux loop needs to
//! route the frame without touching the payload.

use bytes::Bytes;

use crate::FrameFlags;

/// Sentinel value of [`FrameDesc::deadline_ns`] meaning "no deadline".
pub const NO_DEADLINE: u64 = u64::MAX;

/// Encoded descriptor size on byte-stream transports.
pub const DESC_SIZE: usize = 32;

/// The fixed-size routing header of every frame.
///
/// All fields are encoded little-endian by [`FrameDesc::to_bytes`]. In-memory
/// transports pass the struct through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    /// Per-session message counter. Diagnostics only; routing never keys on it.
    pub msg_id: u64,
    /// Channel this frame belongs to. Channel 0 is the control channel.
    pub channel_id: u32,
    /// Method being invoked. Responses and stream chunks carry 0.
    pub method_id: u32,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Absolute call deadline in nanoseconds on the session's monotonic clock,
    /// or [`NO_DEADLINE`].
    pub deadline_ns: u64,
    /// Payload length in bytes.
    pub payload_len: u32,
}

impl FrameDesc {
    pub fn new() -> Self {
        Self {
            msg_id: 0,
            channel_id: 0,
            method_id: 0,
            flags: FrameFlags::empty(),
            deadline_ns: NO_DEADLINE,
            payload_len: 0,
        }
    }

    /// True if this frame carries a deadline.
    pub fn has_deadline(&self) -> bool {
        self.deadline_ns != NO_DEADLINE
    }

    /// Encode the descriptor for byte-stream transports.
    pub fn to_bytes(&self) -> [u8; DESC_SIZE] {
        let mut buf = [0u8; DESC_SIZE];
        buf[0..8].copy_from_slice(&self.msg_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.channel_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.method_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[20..28].copy_from_slice(&self.deadline_ns.to_le_bytes());
        buf[28..32].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a descriptor received from a byte-stream transport.
    ///
    /// Unknown flag bits are dropped rather than rejected.
    pub fn from_bytes(buf: &[u8; DESC_SIZE]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            u64::from_le_bytes(b)
        };
        Self {
            msg_id: u64_at(0),
            channel_id: u32_at(8),
            method_id: u32_at(12),
            flags: FrameFlags::from_bits_truncate(u32_at(16)),
            deadline_ns: u64_at(20),
            payload_len: u32_at(28),
        }
    }
}

impl Default for FrameDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// One frame: descriptor plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub desc: FrameDesc,
    pub payload: Bytes,
}

impl Frame {
    /// Create a payload-less frame (EOS markers, control frames).
    pub fn new(desc: FrameDesc) -> Self {
        Self {
            desc,
            payload: Bytes::new(),
        }
    }

    /// Create a frame carrying a payload; `payload_len` is set from it.
    pub fn with_payload(mut desc: FrameDesc, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        desc.payload_len = payload.len() as u32;
        Self { desc, payload }
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_eos(&self) -> bool {
        self.desc.flags.contains(FrameFlags::EOS)
    }

    pub fn is_error(&self) -> bool {
        self.desc.flags.contains(FrameFlags::ERROR)
    }

    pub fn is_control(&self) -> bool {
        self.desc.flags.contains(FrameFlags::CONTROL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips_through_bytes() {
        let mut desc = FrameDesc::new();
        desc.msg_id = 7;
        desc.channel_id = 3;
        desc.method_id = 0x0104;
        desc.flags = FrameFlags::DATA | FrameFlags::EOS;
        desc.deadline_ns = 1_000_000_000;
        desc.payload_len = 42;

        let decoded = FrameDesc::from_bytes(&desc.to_bytes());
        assert_eq!(decoded, desc);
    }

    #[test]
    fn default_descriptor_has_no_deadline() {
        let desc = FrameDesc::new();
        assert!(!desc.has_deadline());
        assert_eq!(desc.deadline_ns, NO_DEADLINE);
    }

    #[test]
    fn with_payload_sets_length() {
        let frame = Frame::with_payload(FrameDesc::new(), vec![1u8, 2, 3]);
        assert_eq!(frame.desc.payload_len, 3);
        assert_eq!(frame.payload_bytes(), &[1, 2, 3]);
    }
}
