use std::collections::VecDeque;
use std::time::Instant;

/// Parameters of the inter-arrival distribution estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhiParams {
    /// Lower bound on the standard deviation, in milliseconds
    pub min_std_deviation_ms: f64,
    /// Mean assumed while the window is empty, in milliseconds
    pub first_heartbeat_estimate_ms: f64,
}

impl Default for PhiParams {
    fn default() -> Self {
        Self {
            min_std_deviation_ms: 100.0,
            first_heartbeat_estimate_ms: 1000.0,
        }
    }
}

/// Heartbeat history of one monitored member.
///
/// Keeps the last `capacity` inter-arrival intervals (milliseconds), the
/// arrival time of the most recent heartbeat and the last sequence number
/// seen. The window never grows past `capacity`; the oldest sample is
/// evicted first.
#[derive(Debug, Clone)]
pub struct HeartbeatNode {
    address: String,
    capacity: usize,
    params: PhiParams,
    intervals: VecDeque<f64>,
    last_heartbeat: Option<Instant>,
    last_sequence: u64,
    restarts: u64,
}

impl HeartbeatNode {
    pub fn new(address: impl Into<String>, capacity: usize, params: PhiParams) -> Self {
        let capacity = capacity.max(1);
        Self {
            address: address.into(),
            capacity,
            params,
            intervals: VecDeque::with_capacity(capacity),
            last_heartbeat: None,
            last_sequence: 0,
            restarts: 0,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Number of times this member was seen restarting.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Inter-arrival samples in arrival order, oldest first.
    pub fn intervals(&self) -> impl Iterator<Item = f64> + '_ {
        self.intervals.iter().copied()
    }

    pub fn window_len(&self) -> usize {
        self.intervals.len()
    }

    /// Record a heartbeat that arrived at `at`.
    ///
    /// A heartbeat older than the latest one recorded carries no interval
    /// information and only updates the sequence number.
    pub fn add(&mut self, sequence: u64, at: Instant) {
        match self.last_heartbeat {
            Some(last) if at < last => {
                tracing::trace!(address = %self.address, sequence, "Late heartbeat, no interval recorded");
            }
            Some(last) => {
                let interval = at.duration_since(last).as_secs_f64() * 1000.0;
                if self.intervals.len() == self.capacity {
                    self.intervals.pop_front();
                }
                self.intervals.push_back(interval);
                self.last_heartbeat = Some(at);
            }
            None => {
                self.last_heartbeat = Some(at);
            }
        }
        self.last_sequence = self.last_sequence.max(sequence);
    }

    /// Forget all history; the member restarted and `at` is its first heartbeat.
    pub fn reset(&mut self, at: Instant) {
        self.intervals.clear();
        self.last_heartbeat = None;
        self.last_sequence = 0;
        self.restarts += 1;
        self.add(1, at);
    }

    /// Mean of the window, or the configured first estimate if it is empty.
    pub fn mean_ms(&self) -> f64 {
        if self.intervals.is_empty() {
            return self.params.first_heartbeat_estimate_ms;
        }
        self.intervals.iter().sum::<f64>() / self.intervals.len() as f64
    }

    /// Standard deviation of the window, clamped to the configured minimum.
    pub fn std_deviation_ms(&self) -> f64 {
        let raw = if self.intervals.is_empty() {
            self.params.first_heartbeat_estimate_ms / 4.0
        } else {
            let mean = self.mean_ms();
            let variance = self
                .intervals
                .iter()
                .map(|x| (x - mean) * (x - mean))
                .sum::<f64>()
                / self.intervals.len() as f64;
            variance.sqrt()
        };
        raw.max(self.params.min_std_deviation_ms).max(f64::MIN_POSITIVE)
    }

    /// Suspicion level at `now`: `-log10(P(X > elapsed))` with the
    /// inter-arrival time `X` modelled as normal with the window's mean and
    /// standard deviation.
    pub fn phi(&self, now: Instant) -> f64 {
        let elapsed_ms = match self.last_heartbeat {
            Some(last) => now.saturating_duration_since(last).as_secs_f64() * 1000.0,
            None => 0.0,
        };
        phi_for(elapsed_ms, self.mean_ms(), self.std_deviation_ms())
    }
}

/// `-log10` of the normal tail probability past `elapsed_ms`.
///
/// Uses the logistic approximation of the normal CDF,
/// `F(y) ~ 1 / (1 + exp(-y (1.5976 + 0.070566 y^2)))`, so the tail is
/// `1 / (1 + exp(a))` and phi is `softplus(a) / ln 10`. The softplus is
/// evaluated in its overflow-free form, keeping phi finite and strictly
/// increasing in `elapsed_ms`.
pub fn phi_for(elapsed_ms: f64, mean_ms: f64, std_deviation_ms: f64) -> f64 {
    let y = (elapsed_ms - mean_ms) / std_deviation_ms;
    let a = y * (1.5976 + 0.070566 * y * y);
    let softplus = a.max(0.0) + (-a.abs()).exp().ln_1p();
    softplus / std::f64::consts::LN_10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node(capacity: usize) -> HeartbeatNode {
        HeartbeatNode::new("10.0.0.1", capacity, PhiParams::default())
    }

    #[test]
    fn first_heartbeat_records_no_interval() {
        let base = Instant::now();
        let mut n = node(3);
        n.add(1, base);
        assert_eq!(n.window_len(), 0);
        assert_eq!(n.last_heartbeat(), Some(base));
        assert_eq!(n.last_sequence(), 1);
    }

    #[test]
    fn window_evicts_oldest_sample() {
        let base = Instant::now();
        let mut n = node(2);
        n.add(1, base);
        n.add(2, base + Duration::from_millis(100));
        n.add(3, base + Duration::from_millis(300));
        n.add(4, base + Duration::from_millis(600));

        let samples: Vec<f64> = n.intervals().collect();
        assert_eq!(samples.len(), 2);
        assert!((samples[0] - 200.0).abs() < 1e-6);
        assert!((samples[1] - 300.0).abs() < 1e-6);
    }

    #[test]
    fn late_heartbeat_is_not_an_interval() {
        let base = Instant::now();
        let mut n = node(5);
        n.add(1, base + Duration::from_millis(500));
        n.add(2, base);
        assert_eq!(n.window_len(), 0);
        assert_eq!(n.last_heartbeat(), Some(base + Duration::from_millis(500)));
    }

    #[test]
    fn reset_clears_window() {
        let base = Instant::now();
        let mut n = node(5);
        for i in 0..4 {
            n.add(i + 1, base + Duration::from_secs(i));
        }
        assert_eq!(n.window_len(), 3);

        let restart = base + Duration::from_secs(10);
        n.reset(restart);
        assert_eq!(n.window_len(), 0);
        assert_eq!(n.last_sequence(), 1);
        assert_eq!(n.last_heartbeat(), Some(restart));
        assert_eq!(n.restarts(), 1);
    }

    #[test]
    fn std_deviation_is_clamped() {
        let base = Instant::now();
        let mut n = node(10);
        for i in 0..5 {
            n.add(i + 1, base + Duration::from_secs(i));
        }
        assert!((n.mean_ms() - 1000.0).abs() < 1e-6);
        assert!((n.std_deviation_ms() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_uses_first_estimate() {
        let n = node(10);
        assert!((n.mean_ms() - 1000.0).abs() < 1e-9);
        assert!((n.std_deviation_ms() - 250.0).abs() < 1e-9);
    }

    #[test]
    fn phi_at_mean_is_log10_two() {
        let phi = phi_for(1000.0, 1000.0, 100.0);
        assert!((phi - 2f64.log10()).abs() < 1e-12);
    }

    #[test]
    fn phi_is_finite_far_past_the_mean() {
        let phi = phi_for(3_600_000.0, 1000.0, 100.0);
        assert!(phi.is_finite());
        assert!(phi > 1000.0);
    }

    #[test]
    fn phi_is_near_zero_well_before_the_mean() {
        assert!(phi_for(0.0, 1000.0, 100.0) < 1e-10);
    }
}
