//! Frame flag bits.

use bitflags::bitflags;

bitflags! {
    /// Flags carried in each frame descriptor.
    ///
    /// Receivers ignore unknown bits, so the set can grow without breaking
    /// older peers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        /// Frame carries payload data.
        ///
        /// Unary requests and responses are `DATA | EOS`; stream items are
        /// `DATA` with a final empty `DATA | EOS`.
        const DATA     = 0b0000_0001;

        /// Control message (channel 0 only).
        const CONTROL  = 0b0000_0010;

        /// End of stream: the sender half-closes its direction.
        ///
        /// The sender must not send more DATA on the channel after EOS; the
        /// other direction is unaffected.
        const EOS      = 0b0000_0100;

        /// Synthetic marker for a cancelled channel.
        ///
        /// Never sent on the wire as a bare frame; the demux attaches it to
        /// the chunk it fabricates when a CancelChannel control message tears
        /// a channel down, so blocked receivers observe the cancellation.
        const CANCEL   = 0b0000_1000;

        /// Error response; the payload is an encoded status.
        const ERROR    = 0b0001_0000;

        /// Don't send a unary reply frame for this request.
        ///
        /// Set on streaming-call open frames: the server answers with chunks
        /// on the channel (or an ERROR frame), never with a unary response.
        const NO_REPLY = 0b0001_0000_0000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_truncated() {
        let flags = FrameFlags::from_bits_truncate(0xffff_ffff);
        assert!(flags.contains(FrameFlags::DATA | FrameFlags::EOS));
        assert_eq!(flags.bits() & 0b0010_0000, 0);
    }

    #[test]
    fn eos_and_error_are_distinct() {
        let flags = FrameFlags::ERROR | FrameFlags::EOS;
        assert!(flags.contains(FrameFlags::ERROR));
        assert!(flags.contains(FrameFlags::EOS));
        assert!(!flags.contains(FrameFlags::DATA));
    }
}
