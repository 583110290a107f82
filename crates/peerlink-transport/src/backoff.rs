//! Pacing for receive loops whose socket keeps failing.

use std::io;
use std::time::Duration;

/// Retry pacing after consecutive `recv_from` failures.
///
/// The first failure is retried at once (ICMP errors surfacing on a UDP
/// socket are one-off). Each further consecutive failure doubles the pause,
/// from [`RecvBackoff::BASE`] up to [`RecvBackoff::MAX`]. A success resets it.
#[derive(Debug, Default)]
pub(crate) struct RecvBackoff {
    failures: u32,
}

impl RecvBackoff {
    pub(crate) const BASE: Duration = Duration::from_millis(10);
    pub(crate) const MAX: Duration = Duration::from_secs(1);

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }

    /// Pause before the next attempt, given the failures so far.
    pub(crate) fn delay(&self) -> Duration {
        match self.failures {
            0 => Duration::ZERO,
            n => Self::BASE
                .saturating_mul(1 << (n - 1).min(16))
                .min(Self::MAX),
        }
    }

    /// Records a failure, logs it, and waits before the caller retries.
    ///
    /// Only the first failure of a run is logged at `warn`.
    pub(crate) async fn failed(&mut self, socket: &'static str, error: &io::Error) {
        let delay = self.delay();
        if self.failures == 0 {
            tracing::warn!(socket, error = %error, "recv failed");
        } else {
            tracing::debug!(socket, error = %error, failures = self.failures + 1, ?delay, "recv still failing");
        }
        self.failures = self.failures.saturating_add(1);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
