//! Per-call server context.

use std::sync::Arc;

use quartet_core::{Deadline, RpcSession};

/// What a handler knows about the call it is serving: the channel it runs on,
/// the deadline the caller attached, and a cancellation probe.
#[derive(Clone)]
pub struct CallContext {
    session: Arc<RpcSession>,
    channel_id: u32,
    deadline: Option<Deadline>,
}

impl CallContext {
    pub(crate) fn new(session: Arc<RpcSession>, channel_id: u32, deadline: Option<Deadline>) -> Self {
        Self {
            session,
            channel_id,
            deadline,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Cooperative cancellation probe. Long-running handlers check this
    /// between units of work and bail out once the caller has given up.
    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled(self.channel_id)
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("channel_id", &self.channel_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}
