//! Backoff exponentiel borné avec jitter.

use rand::Rng;
use std::time::Duration;

/// Générateur de délais pour les reconnexions et retries.
///
/// Le délai croît en `base * 2^n`, plafonné à `cap`, puis un jitter
/// uniforme est appliqué sur la totalité de la valeur (full jitter) pour
/// désynchroniser une flotte d'écrans qui retentent en même temps.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    /// Backoff standard du transport : base 1 s, plafond 60 s.
    pub fn transport() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Nombre de tentatives déjà effectuées.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Calcule le prochain délai et incrémente le compteur.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);

        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap);

        // Full jitter : uniforme sur [0, raw]
        let millis = raw.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::rng().random_range(0..=millis);
        Duration::from_millis(jittered)
    }

    /// Réinitialise après un succès.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Borne supérieure du prochain délai, sans jitter ni incrément.
    pub fn peek_max(&self) -> Duration {
        let exp = self.attempt.min(16);
        self.base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_are_bounded_by_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(60));
        }
        assert_eq!(backoff.peek_max(), Duration::from_secs(60));
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::transport();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.peek_max(), Duration::from_secs(1));
    }

    #[test]
    fn test_max_grows_exponentially() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.peek_max(), Duration::from_secs(1));
        backoff.next_delay();
        assert_eq!(backoff.peek_max(), Duration::from_secs(2));
        backoff.next_delay();
        assert_eq!(backoff.peek_max(), Duration::from_secs(4));
    }
}
