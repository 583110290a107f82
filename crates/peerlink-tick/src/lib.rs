//! Fixed-period ticker that drives the engine's timeout processing.
//!
//! The uTP engine has no clock of its own: retransmissions, keep-alives and
//! connection timeouts only advance when `check_timeouts` is called. A
//! listening server owns one [`TimeoutTicker`] and calls it on every tick.
//!
//! # Disabled mode
//!
//! When `interval` is zero the ticker is disabled and
//! [`TimeoutTicker::wait_for_tick`] pends forever. A server configured this
//! way only services timeouts when datagrams arrive, which tests use to keep
//! the engine quiet.
//!
//! # Integration
//!
//! The ticker sits inside the server driver's `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         recv = socket.recv_from(&mut buf) => { /* process_udp */ }
//!         _ = ticker.wait_for_tick() => engine.check_timeouts(ctx),
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Ticker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Time between ticks. Zero disables the ticker.
    pub interval: Duration,
    /// Random delay (0..max) added to the first tick so servers started
    /// together do not tick in lockstep.
    pub initial_jitter: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            initial_jitter: Duration::ZERO,
        }
    }
}

impl TickConfig {
    /// The engine's recommended timeout-check period.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
    /// Shortest non-zero interval accepted.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(10);
    /// Longest interval accepted; beyond this connections time out unserviced.
    pub const MAX_INTERVAL: Duration = Duration::from_secs(60);

    /// A config ticking every `interval`.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// A config whose ticker never fires.
    pub fn disabled() -> Self {
        Self::with_interval(Duration::ZERO)
    }

    /// Clamp out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`TimeoutTicker::new`]. Rules:
    /// - a non-zero `interval` is clamped to `MIN_INTERVAL..=MAX_INTERVAL`;
    /// - `initial_jitter` is capped at one `interval`.
    pub fn validated(mut self) -> Self {
        if !self.interval.is_zero() {
            let clamped = self.interval.clamp(Self::MIN_INTERVAL, Self::MAX_INTERVAL);
            if clamped != self.interval {
                warn!(
                    interval_ms = self.interval.as_millis() as u64,
                    clamped_ms = clamped.as_millis() as u64,
                    "tick interval out of range, clamping"
                );
                self.interval = clamped;
            }
        }
        if self.initial_jitter > self.interval {
            self.initial_jitter = self.interval;
        }
        self
    }

    /// The tick period, or `None` when disabled.
    pub fn tick_duration(&self) -> Option<Duration> {
        (!self.interval.is_zero()).then_some(self.interval)
    }
}

// ---------------------------------------------------------------------------
// Tick info
// ---------------------------------------------------------------------------

/// Returned by [`TimeoutTicker::wait_for_tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickInfo {
    /// Monotonically increasing tick number, starting at 1.
    pub tick: u64,
    /// `true` if the tick fired more than 10% of an interval late.
    pub overrun: bool,
    /// Whole intervals missed before this tick fired.
    pub ticks_skipped: u64,
}

/// Counters kept across the ticker's life.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickMetrics {
    pub total_ticks: u64,
    pub total_overruns: u64,
    pub total_skipped: u64,
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Fixed-period ticker. Missed ticks are skipped, never replayed: the engine
/// only needs to see time advance, not every interval.
pub struct TimeoutTicker {
    interval: Option<Duration>,
    next_tick: Option<Instant>,
    tick_count: u64,
    paused: bool,
    metrics: TickMetrics,
}

impl TimeoutTicker {
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        let interval = config.tick_duration();

        let next_tick = interval.map(|d| {
            let max = config.initial_jitter.as_micros() as u64;
            let jitter = if max > 0 {
                Duration::from_micros(rand::rng().random_range(0..max))
            } else {
                Duration::ZERO
            };
            Instant::now() + d + jitter
        });

        match interval {
            Some(d) => debug!(interval_ms = d.as_millis() as u64, "timeout ticker created"),
            None => debug!("timeout ticker created disabled"),
        }

        Self {
            interval,
            next_tick,
            tick_count: 0,
            paused: false,
            metrics: TickMetrics::default(),
        }
    }

    /// Ticker firing every `interval`, no jitter.
    pub fn with_interval(interval: Duration) -> Self {
        Self::new(TickConfig::with_interval(interval))
    }

    /// Waits for the next tick.
    ///
    /// Pends forever while disabled or paused, so it is safe to use as a
    /// `select!` branch unconditionally.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        let (next, interval) = match (self.next_tick, self.interval) {
            (Some(next), Some(interval)) if !self.paused => (next, interval),
            _ => std::future::pending().await,
        };

        time::sleep_until(next).await;

        let now = Instant::now();
        self.tick_count += 1;

        let late_by = now.saturating_duration_since(next);
        let overrun = late_by > interval / 10;
        let ticks_skipped = if overrun {
            (late_by.as_nanos() / interval.as_nanos()) as u64
        } else {
            0
        };
        if ticks_skipped > 0 {
            warn!(
                tick = self.tick_count,
                skipped = ticks_skipped,
                late_ms = late_by.as_millis() as u64,
                "timeout tick late, skipping ahead"
            );
        }
        self.next_tick = Some(now + interval);

        self.metrics.total_ticks += 1;
        self.metrics.total_skipped += ticks_skipped;
        if overrun {
            self.metrics.total_overruns += 1;
        }

        trace!(tick = self.tick_count, overrun, "timeout tick");

        TickInfo {
            tick: self.tick_count,
            overrun,
            ticks_skipped,
        }
    }

    /// Stops ticking until [`resume`](Self::resume). Idempotent.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!(tick = self.tick_count, "timeout ticker paused");
        }
    }

    /// Restarts ticking one full interval from now.
    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            if let Some(interval) = self.interval {
                self.next_tick = Some(Instant::now() + interval);
            }
            debug!(tick = self.tick_count, "timeout ticker resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_disabled(&self) -> bool {
        self.interval.is_none()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_clamps_short_interval() {
        let cfg = TickConfig::with_interval(Duration::from_millis(1)).validated();
        assert_eq!(cfg.interval, TickConfig::MIN_INTERVAL);
    }

    #[test]
    fn test_validated_keeps_zero_interval() {
        let cfg = TickConfig::disabled().validated();
        assert_eq!(cfg.tick_duration(), None);
    }

    #[test]
    fn test_jitter_capped_at_interval() {
        let cfg = TickConfig {
            interval: Duration::from_millis(100),
            initial_jitter: Duration::from_secs(5),
        }
        .validated();
        assert_eq!(cfg.initial_jitter, Duration::from_millis(100));
    }
}
