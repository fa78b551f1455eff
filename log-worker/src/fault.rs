//! Deliberate, random processing failures used to exercise redelivery and dead-lettering.
use std::sync::{Mutex, PoisonError};

use rand::{rngs::StdRng, Rng, SeedableRng};

pub struct FaultInjector {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl FaultInjector {
    /// Fail with `probability`, drawing from `rng`. The probability is clamped to `[0, 1]`.
    pub fn new(probability: f64, rng: StdRng) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };

        Self {
            probability,
            rng: Mutex::new(rng),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, StdRng::seed_from_u64(0))
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Draw once. A probability of 0 never fires and 1 always does.
    pub fn should_fail(&self) -> bool {
        if self.probability <= 0.0 {
            return false;
        }
        if self.probability >= 1.0 {
            return true;
        }

        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.probability)
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_never_fires() {
        let faults = FaultInjector::new(0.0, StdRng::seed_from_u64(1));
        assert!((0..1000).all(|_| !faults.should_fail()));
    }

    #[test]
    fn test_one_always_fires() {
        let faults = FaultInjector::new(1.0, StdRng::seed_from_u64(1));
        assert!((0..1000).all(|_| faults.should_fail()));
    }

    #[test]
    fn test_out_of_range_probabilities_are_clamped() {
        assert_eq!(FaultInjector::new(-3.0, StdRng::seed_from_u64(1)).probability(), 0.0);
        assert_eq!(FaultInjector::new(7.0, StdRng::seed_from_u64(1)).probability(), 1.0);
        assert_eq!(FaultInjector::new(f64::NAN, StdRng::seed_from_u64(1)).probability(), 0.0);
    }

    #[test]
    fn test_seeded_injectors_agree() {
        let first = FaultInjector::new(0.5, StdRng::seed_from_u64(42));
        let second = FaultInjector::new(0.5, StdRng::seed_from_u64(42));

        let first_draws: Vec<bool> = (0..64).map(|_| first.should_fail()).collect();
        let second_draws: Vec<bool> = (0..64).map(|_| second.should_fail()).collect();

        assert_eq!(first_draws, second_draws);
        assert!(first_draws.iter().any(|failed| *failed));
        assert!(first_draws.iter().any(|failed| !*failed));
    }
}
