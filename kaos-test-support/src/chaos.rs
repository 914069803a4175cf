//! Chaos injection for backend deliveries.
//!
//! The backend contract only promises per-entity ordering, so the monkey
//! never reorders. It can duplicate a completion, or slip in a completion
//! for a handle nobody issued; both must be logged and ignored by the client.

use rand::Rng;

/// What to do with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosEvent {
    /// Deliver the completion twice.
    Duplicate,
    /// Also deliver a completion under a handle that was never issued.
    Unsolicited,
    /// Deliver as is.
    None,
}

/// Chaos monkey for backend deliveries.
///
/// # Example
///
/// ```
/// use kaos_test_support::chaos::{ChaosEvent, ChaosMonkey};
///
/// let mut monkey = ChaosMonkey::new().with_duplicate_probability(1.0);
/// assert_eq!(monkey.decide(), ChaosEvent::Duplicate);
/// ```
pub struct ChaosMonkey {
    duplicate_probability: f64,
    unsolicited_probability: f64,
    rng: rand::rngs::StdRng,
    events_triggered: usize,
}

impl Default for ChaosMonkey {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosMonkey {
    pub fn new() -> Self {
        Self {
            duplicate_probability: 0.0,
            unsolicited_probability: 0.0,
            rng: rand::SeedableRng::from_entropy(),
            events_triggered: 0,
        }
    }

    /// Reproducible sequence of decisions.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: rand::SeedableRng::seed_from_u64(seed),
            ..Self::new()
        }
    }

    /// Duplicates and strays on a fifth of deliveries each.
    pub fn aggressive() -> Self {
        Self::new()
            .with_duplicate_probability(0.2)
            .with_unsolicited_probability(0.2)
    }

    pub fn with_duplicate_probability(mut self, prob: f64) -> Self {
        self.duplicate_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_unsolicited_probability(mut self, prob: f64) -> Self {
        self.unsolicited_probability = prob.clamp(0.0, 1.0);
        self
    }

    /// Decide what happens to the next completion.
    pub fn decide(&mut self) -> ChaosEvent {
        let roll = self.rng.gen::<f64>();
        let mut threshold = self.duplicate_probability;
        if roll < threshold {
            self.events_triggered += 1;
            return ChaosEvent::Duplicate;
        }

        threshold += self.unsolicited_probability;
        if roll < threshold {
            self.events_triggered += 1;
            return ChaosEvent::Unsolicited;
        }

        ChaosEvent::None
    }

    /// Number of chaos events triggered.
    pub fn events_triggered(&self) -> usize {
        self.events_triggered
    }
}
