//! Control-channel messages.
//!
//! Control frames travel on channel 0 with the `CONTROL` flag and a method id
//! from [`control_method`]. Their payloads are postcard-encoded
//! [`ControlPayload`] values.

use serde::{Deserialize, Serialize};

/// Method ids used on the control channel.
pub mod control_method {
    /// Tear down a channel. Payload: [`super::ControlPayload::CancelChannel`].
    pub const CANCEL_CHANNEL: u32 = 1;
}

/// Why a channel was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The caller aborted the call.
    Caller,
    /// The caller's deadline elapsed.
    DeadlineExceeded,
}

/// Payload of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlPayload {
    CancelChannel {
        channel_id: u32,
        reason: CancelReason,
    },
}
