use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: DEFAULT_MAX_DELAY_MILLIS,
        }
    }
}

/// Exponential backoff with jitter.
///
/// The first delay after a `reset` is zero so that a fresh failure is retried
/// immediately; every subsequent delay grows by `backoff_factor` up to
/// `max_delay_millis`, with up to 50% jitter in either direction.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_millis: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base_millis: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Makes the next delay the maximum one (used after resource-exhausted errors).
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.config.max_delay_millis as f64;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = jittered_millis(self.current_base_millis, rng);

        self.current_base_millis *= self.config.backoff_factor;
        let initial = self.config.initial_delay_millis as f64;
        let max = self.config.max_delay_millis as f64;
        if self.current_base_millis < initial {
            self.current_base_millis = initial;
        }
        if self.current_base_millis > max {
            self.current_base_millis = max;
        }

        Duration::from_millis(delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

fn jittered_millis<R: Rng + ?Sized>(base: f64, rng: &mut R) -> u64 {
    if base <= 0.0 {
        return 0;
    }
    let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
    (base + jitter).floor().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_delay_is_immediate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::default();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
        let second = backoff.next_delay_with_rng(&mut rng);
        assert!(second >= Duration::from_millis(500));
        assert!(second <= Duration::from_millis(1_500));
    }

    #[test]
    fn delay_is_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            initial_delay_millis: 10,
            backoff_factor: 10.0,
            max_delay_millis: 100,
        });
        for _ in 0..10 {
            let delay = backoff.next_delay_with_rng(&mut rng);
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = ExponentialBackoff::default();
        backoff.next_delay_with_rng(&mut rng);
        backoff.next_delay_with_rng(&mut rng);
        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }
}
