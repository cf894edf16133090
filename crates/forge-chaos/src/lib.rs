//! Fault injection for the harness.
//!
//! A [`FaultInjector`] owns one ChaCha8 random source. Every decision is a
//! fixed number of uniform draws from it, so a seeded injector replays the
//! same fault sequence for the same call order. Stateful latency profiles
//! (bursts, outages) keep their state next to the random source.

use forge_protocol::{FaultDecision, LatencyProfile, StressConfig};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct ProfileState {
    in_burst: bool,
    next_outage: Option<Instant>,
    outage_end: Option<Instant>,
}

impl ProfileState {
    /// Time left in the current blackout, starting one when it is due.
    fn outage_remaining(&mut self, now: Instant, interval: f64, duration: f64) -> Duration {
        let interval = Duration::from_secs_f64(interval);
        let duration = Duration::from_secs_f64(duration);
        let due = *self.next_outage.get_or_insert(now + interval);
        let in_outage = self.outage_end.is_some_and(|end| now < end);
        if !in_outage && now >= due && !duration.is_zero() {
            let end = now + duration;
            self.outage_end = Some(end);
            self.next_outage = Some(end + interval);
            warn!(duration_ms = duration.as_millis() as u64, "outage started");
        }
        self.outage_end
            .map_or(Duration::ZERO, |end| end.saturating_duration_since(now))
    }
}

#[derive(Debug)]
pub struct FaultInjector {
    rng: Mutex<ChaCha8Rng>,
    seed: Mutex<Option<u64>>,
    profile: Mutex<ProfileState>,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    /// Injector seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
            seed: Mutex::new(None),
            profile: Mutex::new(ProfileState::default()),
        }
    }

    /// Deterministic injector.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            seed: Mutex::new(Some(seed)),
            profile: Mutex::new(ProfileState::default()),
        }
    }

    /// Seeded when the stress configuration carries a seed, entropy otherwise.
    pub fn for_stress(stress: &StressConfig) -> Self {
        match stress.seed {
            Some(seed) => Self::seeded(seed),
            None => Self::new(),
        }
    }

    pub fn seed(&self) -> Option<u64> {
        *self.seed.lock()
    }

    /// Restart the random source from `seed`. Profile state starts over too.
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock() = ChaCha8Rng::seed_from_u64(seed);
        *self.seed.lock() = Some(seed);
        self.reset_profile();
    }

    /// Leave any burst and forget the outage schedule.
    pub fn reset_profile(&self) {
        *self.profile.lock() = ProfileState::default();
    }

    pub fn in_burst(&self) -> bool {
        self.profile.lock().in_burst
    }

    /// Decide delay and synthetic failure for one action.
    pub fn inject(&self, stress: &StressConfig) -> FaultDecision {
        self.inject_at(stress, Instant::now())
    }

    /// [`FaultInjector::inject`] against an explicit clock reading.
    ///
    /// Always draws two samples, one against `latency_rate` and one against
    /// `failure_rate`. The flaky-wifi profile adds a burst transition draw,
    /// and a delay draw follows whenever latency applies.
    pub fn inject_at(&self, stress: &StressConfig, now: Instant) -> FaultDecision {
        let stress = stress.clone().validated();
        let mut rng = self.rng.lock();

        let latency_roll: f64 = rng.gen_range(0.0..1.0);
        let failure_roll: f64 = rng.gen_range(0.0..1.0);
        let jittered = latency_roll < stress.latency_rate;

        let secs = match stress.profile {
            LatencyProfile::Uniform => {
                if jittered {
                    jitter(&mut rng, stress.latency_range)
                } else {
                    0.0
                }
            }
            LatencyProfile::FlakyWifi {
                spike_chance,
                spike_multiplier,
            } => {
                let transition: f64 = rng.gen_range(0.0..1.0);
                let in_burst = {
                    let mut profile = self.profile.lock();
                    profile.in_burst = if profile.in_burst {
                        transition >= LatencyProfile::BURST_RECOVERY
                    } else {
                        transition < spike_chance
                    };
                    profile.in_burst
                };
                if in_burst {
                    jitter(&mut rng, stress.latency_range) * spike_multiplier
                } else if jittered {
                    jitter(&mut rng, stress.latency_range)
                } else {
                    0.0
                }
            }
            LatencyProfile::DataCenterOutage { interval, duration } => {
                let blocked = self
                    .profile
                    .lock()
                    .outage_remaining(now, interval, duration);
                if !blocked.is_zero() {
                    blocked.as_secs_f64()
                } else if jittered {
                    jitter(&mut rng, stress.latency_range)
                } else {
                    0.0
                }
            }
        };
        let delay = Duration::from_secs_f64(secs);
        let should_fail = failure_roll < stress.failure_rate;

        if !delay.is_zero() || should_fail {
            debug!(
                delay_ms = delay.as_millis() as u64,
                should_fail,
                profile = stress.profile.name(),
                "fault injected"
            );
        }
        FaultDecision { delay, should_fail }
    }

    /// Per-delivery drop decision for the message bus. One draw per call.
    pub fn should_drop(&self, drop_rate: f64) -> bool {
        let rate = if drop_rate.is_finite() {
            drop_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let roll: f64 = self.rng.lock().gen_range(0.0..1.0);
        roll < rate
    }
}

fn jitter(rng: &mut ChaCha8Rng, [min, max]: [f64; 2]) -> f64 {
    if max > min { rng.gen_range(min..=max) } else { min }
}
