//! Deadlines and the session clock.
//!
//! Deadlines are absolute nanosecond timestamps on a process-wide monotonic
//! clock, so they survive being copied into frame descriptors and compared on
//! either end of an in-process connection. The caller-side half of deadline
//! enforcement is [`governed`]; the server-side half is the session's
//! pre-dispatch expiry check.

use std::future::Future;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::{FrameDesc, NO_DEADLINE, RpcError};

/// Nanoseconds elapsed on the process-wide monotonic clock.
pub fn now_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}

/// An absolute expiry for one call. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at_ns: u64,
}

impl Deadline {
    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(NO_DEADLINE);
        Self {
            expires_at_ns: now_ns().saturating_add(timeout_ns).min(NO_DEADLINE - 1),
        }
    }

    /// Reconstruct a deadline from a raw descriptor timestamp.
    pub fn at_ns(expires_at_ns: u64) -> Self {
        Self { expires_at_ns }
    }

    /// The deadline a received frame carries, if any.
    pub fn from_desc(desc: &FrameDesc) -> Option<Self> {
        desc.has_deadline().then(|| Self::at_ns(desc.deadline_ns))
    }

    /// The raw timestamp for a frame descriptor.
    pub fn as_ns(&self) -> u64 {
        self.expires_at_ns
    }

    pub fn is_expired(&self) -> bool {
        now_ns() > self.expires_at_ns
    }

    /// Time left before expiry; zero once expired.
    pub fn remaining(&self) -> Duration {
        Duration::from_nanos(self.expires_at_ns.saturating_sub(now_ns()))
    }
}

/// Bound a call future with an optional deadline.
///
/// With a deadline, the future is raced against the remaining time and the
/// caller observes `DeadlineExceeded` at the boundary; the future itself is
/// dropped and any server-side work unwinds on its own. Without a deadline the
/// future runs to completion.
pub async fn governed<T, F>(deadline: Option<Deadline>, fut: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>>,
{
    match deadline {
        None => fut.await,
        Some(deadline) => {
            if deadline.is_expired() {
                return Err(RpcError::DeadlineExceeded);
            }
            match tokio::time::timeout(deadline.remaining(), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(RpcError::DeadlineExceeded),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_expires_immediately() {
        let deadline = Deadline::after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(1));
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn future_deadline_is_not_expired() {
        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() > Duration::from_secs(59));
    }

    #[test]
    fn descriptor_round_trip() {
        let mut desc = FrameDesc::new();
        assert!(Deadline::from_desc(&desc).is_none());

        let deadline = Deadline::after(Duration::from_secs(5));
        desc.deadline_ns = deadline.as_ns();
        assert_eq!(Deadline::from_desc(&desc), Some(deadline));
    }

    #[tokio::test]
    async fn governed_returns_deadline_exceeded_for_slow_futures() {
        let deadline = Some(Deadline::after(Duration::from_millis(10)));
        let result: Result<(), _> = governed(deadline, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RpcError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn governed_passes_fast_futures_through() {
        let deadline = Some(Deadline::after(Duration::from_secs(5)));
        let result = governed(deadline, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn governed_short_circuits_expired_deadlines() {
        let deadline = Some(Deadline::after(Duration::ZERO));
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result: Result<(), _> = governed(deadline, async {
            panic!("future must not run");
        })
        .await;
        assert!(matches!(result, Err(RpcError::DeadlineExceeded)));
    }
}
