//! # Pacing and throughput reporting.
//!
//! [`RateLimiter`] paces the user loop at a configured frequency using
//! absolute deadlines, so callback jitter does not accumulate.
//!
//! [`RateLogger`] is the auxiliary worker active during `Running`: once a
//! second it advances a per-channel interval counter and, whenever a
//! channel's `rateLogging` period is reached, logs one line with the
//! channel's in/out throughput since its previous line. The worker exits as
//! soon as a state transition is pending; the run engine joins it on the way
//! out of `Running`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::channel::{Channel, ChannelCounters};
use crate::machine::StateMachine;

/// Paces a loop at `rate` Hz.
pub struct RateLimiter {
    period: Duration,
    next: Instant,
}

impl RateLimiter {
    pub fn new(rate: f64) -> Self {
        let period = if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        };
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Sleeps until the next deadline, then advances it by one period.
    pub async fn maybe_sleep(&mut self) {
        if self.period.is_zero() {
            return;
        }
        tokio::time::sleep_until(self.next).await;
        self.next += self.period;
    }
}

struct RateEntry {
    name: String,
    counters: Arc<ChannelCounters>,
    /// Log period in seconds.
    interval: u32,
    /// Seconds since the last line.
    counter: u32,
    bytes_in: u64,
    messages_in: u64,
    bytes_out: u64,
    messages_out: u64,
    since: Instant,
}

impl RateEntry {
    fn snapshot(&mut self, now: Instant) {
        self.bytes_in = self.counters.bytes_in();
        self.messages_in = self.counters.messages_in();
        self.bytes_out = self.counters.bytes_out();
        self.messages_out = self.counters.messages_out();
        self.since = now;
    }
}

/// Converts a traffic delta over `elapsed_ms` into (MB/s, msg/s).
fn rates(delta_bytes: u64, delta_messages: u64, elapsed_ms: u64) -> (f64, f64) {
    if elapsed_ms == 0 {
        return (0.0, 0.0);
    }
    let mb_per_s = (delta_bytes as f64 / 1_000_000.0) / elapsed_ms as f64 * 1000.0;
    let msg_per_s = delta_messages as f64 / elapsed_ms as f64 * 1000.0;
    (mb_per_s, msg_per_s)
}

/// Per-channel throughput logger.
pub(crate) struct RateLogger {
    entries: Vec<RateEntry>,
    /// Column width: length of the longest monitored channel name.
    width: usize,
}

impl RateLogger {
    /// Builds a logger over every sub-channel with `rateLogging > 0`;
    /// `None` when nothing is monitored.
    pub(crate) fn from_channels(channels: &HashMap<String, Vec<Channel>>) -> Option<Self> {
        let now = Instant::now();
        let mut entries = Vec::new();
        for subs in channels.values() {
            for sub in subs {
                if sub.rate_logging() > 0 {
                    let mut entry = RateEntry {
                        name: sub.name().to_string(),
                        counters: Arc::clone(sub.counters()),
                        interval: sub.rate_logging(),
                        counter: 0,
                        bytes_in: 0,
                        messages_in: 0,
                        bytes_out: 0,
                        messages_out: 0,
                        since: now,
                    };
                    entry.snapshot(now);
                    entries.push(entry);
                }
            }
        }
        if entries.is_empty() {
            return None;
        }
        let width = entries.iter().map(|e| e.name.len()).max().unwrap_or(0);
        Some(Self { entries, width })
    }

    /// Ticks once a second until a state transition is pending.
    pub(crate) async fn run(mut self, machine: StateMachine) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => self.tick(Instant::now()),
                _ = machine.wait_for_pending_state() => break,
            }
        }
    }

    fn tick(&mut self, now: Instant) {
        for entry in &mut self.entries {
            entry.counter += 1;
            if entry.counter < entry.interval {
                continue;
            }
            entry.counter = 0;

            let elapsed_ms = now.saturating_duration_since(entry.since).as_millis() as u64;
            if elapsed_ms == 0 {
                continue;
            }
            let (mb_in, msg_in) = rates(
                entry.counters.bytes_in() - entry.bytes_in,
                entry.counters.messages_in() - entry.messages_in,
                elapsed_ms,
            );
            let (mb_out, msg_out) = rates(
                entry.counters.bytes_out() - entry.bytes_out,
                entry.counters.messages_out() - entry.messages_out,
                elapsed_ms,
            );
            entry.snapshot(now);

            info!(
                "{:>width$}: in: {:.1} msg/s ({:.3} MB/s), out: {:.1} msg/s ({:.3} MB/s)",
                entry.name,
                msg_in,
                mb_in,
                msg_out,
                mb_out,
                width = self.width,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Properties;

    #[test]
    fn rates_scale_to_seconds() {
        let (mb, msg) = rates(2_000_000, 500, 2_000);
        assert!((mb - 1.0).abs() < f64::EPSILON);
        assert!((msg - 250.0).abs() < f64::EPSILON);
        assert_eq!(rates(1, 1, 0), (0.0, 0.0));
    }

    #[test]
    fn logger_only_monitors_rate_logged_channels() {
        let config = Properties::new();
        config.set("chans.data.0.address", "memory://a");
        config.set("chans.data.0.method", "bind");
        config.set("chans.data.0.rateLogging", 1_u64);
        config.set("chans.quiet.0.address", "memory://b");
        config.set("chans.quiet.0.method", "connect");
        config.set("chans.quiet.0.rateLogging", 0_u64);

        let mut channels = HashMap::new();
        channels.insert(
            "data".to_string(),
            vec![Channel::from_properties("data", 0, &config).unwrap()],
        );
        channels.insert(
            "quiet".to_string(),
            vec![Channel::from_properties("quiet", 0, &config).unwrap()],
        );

        let logger = RateLogger::from_channels(&channels).unwrap();
        assert_eq!(logger.entries.len(), 1);
        assert_eq!(logger.entries[0].name, "data[0]");
        assert_eq!(logger.width, "data[0]".len());
    }

    #[test]
    fn nothing_monitored_means_no_logger() {
        let config = Properties::new();
        config.set("chans.quiet.0.address", "memory://b");
        config.set("chans.quiet.0.method", "connect");
        config.set("chans.quiet.0.rateLogging", 0_u64);

        let mut channels = HashMap::new();
        channels.insert(
            "quiet".to_string(),
            vec![Channel::from_properties("quiet", 0, &config).unwrap()],
        );
        assert!(RateLogger::from_channels(&channels).is_none());
    }

    #[tokio::test]
    async fn limiter_paces_iterations() {
        let mut limiter = RateLimiter::new(100.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.maybe_sleep().await;
        }
        // 5 iterations at 100 Hz: at least ~50 ms wall time
        assert!(start.elapsed() >= Duration::from_millis(45));

        // unlimited: returns immediately
        let mut unlimited = RateLimiter::new(0.0);
        let start = Instant::now();
        for _ in 0..1000 {
            unlimited.maybe_sleep().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
