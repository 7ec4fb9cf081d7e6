//! Emission pacing for streaming handlers.

use std::time::Duration;

/// How a streaming server paces its emissions.
///
/// Backpressure from the per-channel buffer gates production either way;
/// pacing only spaces chunks out for interactive demos.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pacing {
    #[default]
    None,
    Fixed(Duration),
}

impl Pacing {
    /// Wait out one emission interval.
    pub async fn pause(&self) {
        if let Pacing::Fixed(interval) = self {
            tokio::time::sleep(*interval).await;
        }
    }
}
