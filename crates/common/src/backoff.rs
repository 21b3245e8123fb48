use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter for stream reconnection.
///
/// The delay ceiling doubles per attempt from `base` up to `cap`; each
/// actual delay is drawn uniformly from `[0, ceiling]` so a fleet of
/// reconnecting clients never synchronises.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            attempt: 0,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Ceiling the next delay will be drawn under.
    pub fn ceiling(&self) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap)
    }

    /// Draw the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        if ceiling.is_zero() {
            return ceiling;
        }
        let secs = rand::thread_rng().gen_range(0.0..=ceiling.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Forget past failures, e.g. after a stable session.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_up_to_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

        let mut ceilings = Vec::new();
        for _ in 0..8 {
            ceilings.push(backoff.ceiling().as_secs());
            backoff.next_delay();
        }
        assert_eq!(ceilings, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_delay_stays_under_ceiling() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(60));
        for _ in 0..20 {
            let ceiling = backoff.ceiling();
            let delay = backoff.next_delay();
            assert!(delay <= ceiling, "delay {delay:?} over ceiling {ceiling:?}");
        }
    }

    #[test]
    fn test_reset_restores_base_ceiling() {
        let mut backoff = ExponentialBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.ceiling(), Duration::from_secs(1));
    }
}
