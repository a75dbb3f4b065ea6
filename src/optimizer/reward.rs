//! Reward specification for optimization objectives.

use serde::{Deserialize, Serialize};

/// Weighted objective over success, latency and attempts.
///
/// Latency and attempts carry negative weights (lower is better). While the
/// overall success rate is below 0.9 they are zeroed out entirely, so the
/// optimizer chases correctness before speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardSpec {
    pub success_weight: f64,
    pub latency_weight: f64,
    pub attempts_weight: f64,
}

impl Default for RewardSpec {
    fn default() -> Self {
        Self {
            success_weight: 2.0,
            latency_weight: -0.3,
            attempts_weight: -0.2,
        }
    }
}

impl RewardSpec {
    pub fn new(success_weight: f64, latency_weight: f64, attempts_weight: f64) -> Self {
        Self {
            success_weight,
            latency_weight,
            attempts_weight,
        }
    }

    /// Reward for a single trace.
    pub fn compute(
        &self,
        success: bool,
        latency_secs: f64,
        attempts: usize,
        overall_success_rate: Option<f64>,
    ) -> f64 {
        let success_score = if success { 1.0 } else { 0.0 };

        let (latency_weight, attempts_weight) = match overall_success_rate {
            Some(rate) if rate < 0.9 => (0.0, 0.0),
            _ => (self.latency_weight, self.attempts_weight),
        };

        self.success_weight * success_score
            + latency_weight * latency_secs
            + attempts_weight * attempts as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec = RewardSpec::default();
        assert_eq!(spec.success_weight, 2.0);
        assert_eq!(spec.latency_weight, -0.3);
        assert_eq!(spec.attempts_weight, -0.2);
    }

    #[test]
    fn test_reward_penalizes_latency_and_attempts() {
        let spec = RewardSpec::default();
        let reward = spec.compute(true, 10.0, 5, None);
        assert!((reward - (2.0 - 3.0 - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_low_success_rate_zeroes_speed_weights() {
        let spec = RewardSpec::default();
        let reward = spec.compute(true, 100.0, 50, Some(0.5));
        assert_eq!(reward, 2.0);

        let reward = spec.compute(false, 100.0, 50, Some(0.5));
        assert_eq!(reward, 0.0);

        // At or above 0.9, speed counts again.
        let reward = spec.compute(true, 10.0, 0, Some(0.95));
        assert!((reward - (2.0 - 3.0)).abs() < 1e-9);
    }
}
