//! Confidence arithmetic: two distinct dynamics, kept in one place and
//! unit-tested directly against their exact constants.
//!
//! *Solutions* use an EMA Q-value, clamped to [0,1], alpha=0.3 — recency dominates.
//! *Rules* use a Laplace-smoothed success rate, which stays in (0,1) by construction.

pub const SOLUTION_ALPHA: f64 = 0.3;

/// EMA step toward `reward` (1.0 on success, -1.0 on failure), clamped to [0,1].
pub fn ema_step(confidence: f64, reward: f64) -> f64 {
    (confidence + SOLUTION_ALPHA * (reward - confidence)).clamp(0.0, 1.0)
}

/// Laplace-smoothed success rate from post-update hit/miss counts.
pub fn laplace_confidence(hits: i64, misses: i64) -> f64 {
    (hits as f64 + 1.0) / (hits as f64 + misses as f64 + 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_success_step_from_default() {
        // single EMA step from 0.5 on success ~= 0.65
        let next = ema_step(0.5, 1.0);
        assert!((next - 0.65).abs() < 1e-9);
    }

    #[test]
    fn ema_failure_step_from_default() {
        let next = ema_step(0.5, -1.0);
        assert!((next - 0.35).abs() < 1e-9);
    }

    #[test]
    fn ema_clamps_to_unit_interval() {
        let mut c = 0.0;
        for _ in 0..100 {
            c = ema_step(c, -1.0);
        }
        assert!(c >= 0.0);
        let mut c = 1.0;
        for _ in 0..100 {
            c = ema_step(c, 1.0);
        }
        assert!(c <= 1.0);
    }

    #[test]
    fn laplace_no_observations_is_half() {
        assert!((laplace_confidence(0, 0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn laplace_never_hits_zero_or_one() {
        assert!(laplace_confidence(0, 1000) > 0.0);
        assert!(laplace_confidence(1000, 0) < 1.0);
    }

    #[test]
    fn laplace_first_hit_after_one_prior_miss() {
        // pre-update hits=0 misses=1; a hit increments hits -> (1+1)/(1+1+2) = 0.5
        assert!((laplace_confidence(1, 1) - 0.5).abs() < 1e-9);
    }
}
