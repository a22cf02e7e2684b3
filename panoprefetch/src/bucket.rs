//! Token bucket du budget de bande passante.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use panocache::RateLimiter;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Comptabilité octets-par-seconde fenêtrée sur la dernière seconde.
///
/// Le seau se remplit continûment au débit configuré et plafonne à une
/// seconde de budget : un téléchargement en rafale ne peut donc pas
/// dépasser le débit moyen sur une fenêtre d'une seconde.
pub struct TokenBucket {
    /// Débit en octets par seconde ; 0 = suspendu
    rate: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Construit un seau depuis un budget en Mbit/s.
    pub fn from_mbits(mbits: u64) -> Self {
        Self::new(mbits * 1_000_000 / 8)
    }

    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            state: Mutex::new(BucketState {
                tokens: rate_bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attend le droit de consommer `bytes` octets.
    ///
    /// Avec un débit nul, l'attente ne se termine jamais : l'appelant
    /// doit la composer avec son annulation.
    pub async fn acquire(&self, bytes: usize) {
        if self.rate == 0 {
            // Budget nul : téléchargements suspendus
            std::future::pending::<()>().await;
        }

        // Un chunk plus grand qu'une seconde de budget est facturé au
        // plafond, sinon il ne passerait jamais
        let cost = (bytes as f64).min(self.rate as f64);

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.rate as f64);
                state.last_refill = now;

                if state.tokens >= cost {
                    state.tokens -= cost;
                    return;
                }
                (cost - state.tokens) / self.rate as f64
            };

            tokio::time::sleep(std::time::Duration::from_secs_f64(wait)).await;
        }
    }
}

impl RateLimiter for TokenBucket {
    fn acquire(&self, bytes: usize) -> BoxFuture<'_, ()> {
        TokenBucket::acquire(self, bytes).boxed()
    }
}
