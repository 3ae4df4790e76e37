//! Seeded random commit failures.

use std::sync::{Mutex, PoisonError};

use nutype::nutype;
use rand::{Rng, SeedableRng, random, rngs::StdRng};

use crate::simulator::MessagingFailure;

/// Probability value for chaos injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```ignore
/// use dualcommit_testing::Probability;
///
/// let never = Probability::try_new(0.0).unwrap();
/// let always = Probability::try_new(1.0).unwrap();
///
/// assert!(Probability::try_new(1.5).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

fn clamped(probability: f32) -> Probability {
    let value = if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    };
    Probability::try_new(value).expect("clamped value is always valid")
}

/// Random commit failures for soak and property tests.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    storage_commit_failure: Probability,
    messaging_commit_failure: Probability,
    messaging_failure: MessagingFailure,
}

impl ChaosConfig {
    /// A config whose random choices repeat from run to run.
    pub fn deterministic() -> Self {
        Self::seeded(0)
    }

    /// A config seeded with `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            deterministic_seed: Some(seed),
            ..Self::default()
        }
    }

    /// Fail storage commits with `probability` (clamped to [0.0, 1.0]).
    #[must_use]
    pub fn with_storage_commit_failure(mut self, probability: f32) -> Self {
        self.storage_commit_failure = clamped(probability);
        self
    }

    /// Fail messaging commits with `probability` (clamped to [0.0, 1.0]).
    #[must_use]
    pub fn with_messaging_commit_failure(mut self, probability: f32) -> Self {
        self.messaging_commit_failure = clamped(probability);
        self
    }

    /// How an injected messaging failure behaves (default: `AfterAcknowledge`).
    #[must_use]
    pub const fn with_messaging_failure(mut self, failure: MessagingFailure) -> Self {
        self.messaging_failure = failure;
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            storage_commit_failure: clamped(0.0),
            messaging_commit_failure: clamped(0.0),
            messaging_failure: MessagingFailure::AfterAcknowledge,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Chaos {
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl Chaos {
    pub(crate) fn new(config: ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    pub(crate) fn storage_commit_fails(&self) -> bool {
        self.should_inject(self.config.storage_commit_failure)
    }

    pub(crate) fn messaging_commit_failure(&self) -> Option<MessagingFailure> {
        self.should_inject(self.config.messaging_commit_failure)
            .then_some(self.config.messaging_failure)
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_bool(f64::from(probability))
    }
}
