//! Per-channel call state: the half-close lifecycle and tombstones.
//!
//! Each RPC invocation owns one channel. Its two directions terminate
//! independently (HTTP/2-style half-close): a side that has sent EOS may keep
//! receiving until the peer sends its own EOS. The channel is fully closed
//! only when both flags are set.

use std::collections::{HashMap, VecDeque};

/// Channel lifecycle state.
///
/// - `Open`: both sides can send.
/// - `HalfClosedLocal`: we sent EOS, the peer can still send.
/// - `HalfClosedRemote`: the peer sent EOS, we can still send.
/// - `Closed`: both sides sent EOS (or the channel was cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelLifecycle {
    #[default]
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// State tracked for one active channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    pub lifecycle: ChannelLifecycle,
    /// Whether this channel has been cancelled.
    pub cancelled: bool,
    /// Data frames sent on this channel.
    pub frames_sent: u64,
    /// Data frames received on this channel.
    pub frames_received: u64,
}

impl ChannelState {
    /// True while our outbound direction is open.
    pub fn can_send(&self) -> bool {
        !self.cancelled
            && matches!(
                self.lifecycle,
                ChannelLifecycle::Open | ChannelLifecycle::HalfClosedRemote
            )
    }

    /// True while the peer's direction is open.
    pub fn can_receive(&self) -> bool {
        !self.cancelled
            && matches!(
                self.lifecycle,
                ChannelLifecycle::Open | ChannelLifecycle::HalfClosedLocal
            )
    }

    /// Transition after we send EOS.
    pub fn mark_local_eos(&mut self) {
        self.lifecycle = match self.lifecycle {
            ChannelLifecycle::Open => ChannelLifecycle::HalfClosedLocal,
            ChannelLifecycle::HalfClosedRemote => ChannelLifecycle::Closed,
            other => other,
        };
    }

    /// Transition after receiving EOS from the peer.
    pub fn mark_remote_eos(&mut self) {
        self.lifecycle = match self.lifecycle {
            ChannelLifecycle::Open => ChannelLifecycle::HalfClosedRemote,
            ChannelLifecycle::HalfClosedLocal => ChannelLifecycle::Closed,
            other => other,
        };
    }
}

/// Terminal snapshot of a channel, retained after its state is pruned.
#[derive(Debug, Clone, Copy)]
pub struct TombstoneInfo {
    pub lifecycle: ChannelLifecycle,
    pub cancelled: bool,
}

/// Bounded set of recently closed channels.
///
/// Late frames for a tombstoned channel are dropped instead of re-opening
/// state for it. Eviction is FIFO so memory stays bounded no matter how many
/// channels a long-lived session churns through.
#[derive(Debug)]
pub struct Tombstones {
    max: usize,
    order: VecDeque<u32>,
    map: HashMap<u32, TombstoneInfo>,
}

impl Tombstones {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            order: VecDeque::new(),
            map: HashMap::new(),
        }
    }

    pub fn contains(&self, channel_id: u32) -> bool {
        self.map.contains_key(&channel_id)
    }

    pub fn get(&self, channel_id: u32) -> Option<&TombstoneInfo> {
        self.map.get(&channel_id)
    }

    /// Insert or update an entry, evicting the oldest entries past the cap.
    pub fn insert(&mut self, channel_id: u32, info: TombstoneInfo) {
        let existed = self.map.insert(channel_id, info).is_some();
        if !existed {
            self.order.push_back(channel_id);
        }

        while self.order.len() > self.max {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_close_in_either_order_reaches_closed() {
        let mut state = ChannelState::default();
        state.mark_local_eos();
        assert_eq!(state.lifecycle, ChannelLifecycle::HalfClosedLocal);
        assert!(!state.can_send());
        assert!(state.can_receive());
        state.mark_remote_eos();
        assert_eq!(state.lifecycle, ChannelLifecycle::Closed);

        let mut state = ChannelState::default();
        state.mark_remote_eos();
        assert_eq!(state.lifecycle, ChannelLifecycle::HalfClosedRemote);
        assert!(state.can_send());
        assert!(!state.can_receive());
        state.mark_local_eos();
        assert_eq!(state.lifecycle, ChannelLifecycle::Closed);
    }

    #[test]
    fn duplicate_eos_is_idempotent() {
        let mut state = ChannelState::default();
        state.mark_local_eos();
        state.mark_local_eos();
        assert_eq!(state.lifecycle, ChannelLifecycle::HalfClosedLocal);
        state.mark_remote_eos();
        state.mark_remote_eos();
        assert_eq!(state.lifecycle, ChannelLifecycle::Closed);
    }

    #[test]
    fn cancelled_channel_can_neither_send_nor_receive() {
        let state = ChannelState {
            cancelled: true,
            ..ChannelState::default()
        };
        assert!(!state.can_send());
        assert!(!state.can_receive());
    }

    #[test]
    fn tombstones_evict_fifo() {
        let mut tombstones = Tombstones::new(2);
        let info = TombstoneInfo {
            lifecycle: ChannelLifecycle::Closed,
            cancelled: false,
        };
        tombstones.insert(1, info);
        tombstones.insert(3, info);
        tombstones.insert(5, info);
        assert!(!tombstones.contains(1));
        assert!(tombstones.contains(3));
        assert!(tombstones.contains(5));
    }

    #[test]
    fn tombstone_update_does_not_duplicate_order() {
        let mut tombstones = Tombstones::new(2);
        let closed = TombstoneInfo {
            lifecycle: ChannelLifecycle::Closed,
            cancelled: false,
        };
        let cancelled = TombstoneInfo {
            lifecycle: ChannelLifecycle::Closed,
            cancelled: true,
        };
        tombstones.insert(1, closed);
        tombstones.insert(1, cancelled);
        tombstones.insert(3, closed);
        assert!(tombstones.contains(1));
        assert!(tombstones.get(1).unwrap().cancelled);
        assert!(tombstones.contains(3));
    }
}
