//! Download and apply speed meters.
//!
//! The download meter is a rolling average over recent batch transfers; the
//! apply meter is an exponentially weighted moving average tuned to a
//! one-minute time constant, which tracks validation throughput without
//! jumping on every burst.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Rolling average over the most recent samples.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingAverage {
    /// A meter remembering up to `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record one sample, evicting the oldest when full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Record a rate sample from a count over an elapsed duration.
    pub fn record(&mut self, count: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.push(count as f64 / secs);
        }
    }

    /// Mean of the recorded samples, or 0.0 before the first sample.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Exponentially weighted moving average of an event rate.
///
/// Handles irregular observation intervals: each observation decays the
/// previous estimate by `exp(-dt / tau)` before mixing in the instantaneous
/// rate, so a long gap between events pulls the estimate down smoothly.
#[derive(Debug, Clone)]
pub struct Ewma {
    tau: Duration,
    rate: f64,
    primed: bool,
}

impl Ewma {
    /// A meter with the given time constant.
    pub fn new(tau: Duration) -> Self {
        Self {
            tau,
            rate: 0.0,
            primed: false,
        }
    }

    /// Record `count` events observed over the `dt` since the previous call.
    pub fn observe(&mut self, count: f64, dt: Duration) {
        let dt_s = dt.as_secs_f64();
        if dt_s <= 0.0 {
            return;
        }
        let instantaneous = count / dt_s;
        if !self.primed {
            self.rate = instantaneous;
            self.primed = true;
            return;
        }
        let alpha = 1.0 - (-dt_s / self.tau.as_secs_f64()).exp();
        self.rate += alpha * (instantaneous - self.rate);
    }

    /// Current smoothed rate in events per second.
    pub fn rate(&self) -> f64 {
        if self.primed { self.rate } else { 0.0 }
    }
}

/// Bundled sync meters: download batches and per-block applies.
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    download: RollingAverage,
    apply: Ewma,
    last_apply: Option<Instant>,
}

/// Batches remembered by the download rolling average.
const DOWNLOAD_SAMPLE_WINDOW: usize = 8;

/// Time constant of the apply-rate average.
const APPLY_RATE_TAU: Duration = Duration::from_secs(60);

impl SyncMetrics {
    /// Fresh meters, both reading zero.
    pub fn new() -> Self {
        Self {
            download: RollingAverage::new(DOWNLOAD_SAMPLE_WINDOW),
            apply: Ewma::new(APPLY_RATE_TAU),
            last_apply: None,
        }
    }

    /// Record a completed batch download.
    pub fn record_download(&mut self, blocks: usize, elapsed: Duration) {
        self.download.record(blocks as u64, elapsed);
    }

    /// Record one applied block at `now`.
    pub fn record_apply(&mut self, now: Instant) {
        if let Some(last) = self.last_apply {
            self.apply.observe(1.0, now.saturating_duration_since(last));
        }
        self.last_apply = Some(now);
    }

    /// Rolling average download speed, blocks per second.
    pub fn download_rate(&self) -> f64 {
        self.download.average()
    }

    /// Smoothed apply speed, blocks per second.
    pub fn apply_rate(&self) -> f64 {
        self.apply.rate()
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rolling_average_starts_at_zero() {
        assert_eq!(RollingAverage::new(4).average(), 0.0);
    }

    #[test]
    fn rolling_average_of_pushed_samples() {
        let mut avg = RollingAverage::new(4);
        avg.push(2.0);
        avg.push(4.0);
        assert_eq!(avg.average(), 3.0);
    }

    #[test]
    fn rolling_average_evicts_oldest() {
        let mut avg = RollingAverage::new(2);
        avg.push(100.0);
        avg.push(2.0);
        avg.push(4.0);
        assert_eq!(avg.average(), 3.0);
    }

    #[test]
    fn record_converts_count_and_elapsed() {
        let mut avg = RollingAverage::new(4);
        avg.record(20, Duration::from_secs(2));
        assert_eq!(avg.average(), 10.0);
    }

    #[test]
    fn record_ignores_zero_elapsed() {
        let mut avg = RollingAverage::new(4);
        avg.record(20, Duration::ZERO);
        assert_eq!(avg.average(), 0.0);
    }

    #[test]
    fn ewma_first_observation_sets_rate() {
        let mut ewma = Ewma::new(Duration::from_secs(60));
        assert_eq!(ewma.rate(), 0.0);
        ewma.observe(10.0, Duration::from_secs(1));
        assert_eq!(ewma.rate(), 10.0);
    }

    #[test]
    fn ewma_moves_toward_new_rate() {
        let mut ewma = Ewma::new(Duration::from_secs(60));
        ewma.observe(10.0, Duration::from_secs(1));
        ewma.observe(20.0, Duration::from_secs(1));
        let rate = ewma.rate();
        assert!(rate > 10.0 && rate < 20.0, "rate {rate} not between inputs");
    }

    #[test]
    fn ewma_decays_over_long_gaps() {
        let mut ewma = Ewma::new(Duration::from_secs(60));
        ewma.observe(100.0, Duration::from_secs(1));
        // One event over ten minutes: the estimate should collapse toward it.
        ewma.observe(1.0, Duration::from_secs(600));
        assert!(ewma.rate() < 1.0);
    }

    #[test]
    fn metrics_apply_rate_needs_two_events() {
        let mut metrics = SyncMetrics::new();
        let start = Instant::now();
        metrics.record_apply(start);
        assert_eq!(metrics.apply_rate(), 0.0);
        metrics.record_apply(start + Duration::from_millis(100));
        assert!(metrics.apply_rate() > 0.0);
    }

    proptest! {
        /// The EWMA estimate always stays within the range of observed rates.
        #[test]
        fn ewma_bounded_by_observations(
            rates in proptest::collection::vec(0.1f64..1000.0, 1..20),
            dt_ms in 1u64..10_000,
        ) {
            let mut ewma = Ewma::new(Duration::from_secs(60));
            let dt = Duration::from_millis(dt_ms);
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for &count in &rates {
                let inst = count / dt.as_secs_f64();
                lo = lo.min(inst);
                hi = hi.max(inst);
                ewma.observe(count, dt);
            }
            prop_assert!(ewma.rate() >= lo - 1e-9);
            prop_assert!(ewma.rate() <= hi + 1e-9);
        }

        /// A rolling average of identical samples is that sample.
        #[test]
        fn rolling_average_of_constant(sample in 0.0f64..1e6, n in 1usize..32) {
            let mut avg = RollingAverage::new(8);
            for _ in 0..n {
                avg.push(sample);
            }
            prop_assert!((avg.average() - sample).abs() < 1e-6);
        }
    }
}
