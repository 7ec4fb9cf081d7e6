//! quartet-core: the frame protocol, transports and the multiplexed RPC
//! session underneath the quartet service family.
//!
//! One connection carries many concurrent calls. Each call owns a channel id;
//! frames are routed by channel by a single demux loop ([`RpcSession::run`]),
//! which is the only caller of `recv_frame` on the transport. Everything above
//! this crate works in typed envelopes; everything below it is bytes.

pub mod channel;
pub mod codec;
pub mod control;
pub mod deadline;
mod error;
mod flags;
mod frame;
pub mod session;
pub mod transport;

pub use channel::{ChannelLifecycle, ChannelState, TombstoneInfo, Tombstones};
pub use control::{CancelReason, ControlPayload, control_method};
pub use deadline::{Deadline, governed, now_ns};
pub use error::{
    ErrorCode, FrameError, RpcError, TransportError, encode_error_payload, parse_error_payload,
};
pub use flags::FrameFlags;
pub use frame::{DESC_SIZE, Frame, FrameDesc, NO_DEADLINE};
pub use session::{RpcSession, StreamChunk};
pub use transport::Transport;
