//! Outcome of one reconcile step and the requeue policy derived from it

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::crd::ErrorType;
use crate::error::{Error, Result};

/// Exponent cap, 2^9 minutes is roughly 8.5 hours
pub const MAX_BACKOFF_EXPONENT: i32 = 9;

/// Exponential backoff with jitter.
///
/// The random source is owned by the instance so that reconcilers of different objects do not
/// retry in lockstep and tests can assert exact values with [`Backoff::seeded`].
pub struct Backoff {
    rng: Mutex<StdRng>,
}

impl Backoff {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Backoff before jitter: `2^n` minutes with `n` clamped to `[0, 9]`.
    pub fn base(error_count: i32) -> Duration {
        let exponent = error_count.clamp(0, MAX_BACKOFF_EXPONENT) as u32;
        Duration::from_secs(60 * 2u64.pow(exponent))
    }

    /// `base(n)` minus a uniform jitter in `[0, base(n) / 2)`.
    pub fn calculate(&self, error_count: i32) -> Duration {
        let base = Self::base(error_count).as_secs_f64();
        let jitter = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(0.0..base * 0.5)
        };
        Duration::from_secs_f64(base - jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff").finish_non_exhaustive()
    }
}

/// What a handler decided in this pass
#[derive(Debug)]
pub enum ActionResult {
    /// Come back after the given delay, work is still in progress
    Continue(Duration),
    /// Re-check soon, uses the first backoff step
    Delayed,
    /// The current step is done, requeue right away for the next one
    Complete,
    /// Deletion finished, nothing left to do
    DeleteComplete,
    /// An error was recorded on the object, retry with backoff based on its count
    Failed {
        error_type: ErrorType,
        error_count: i32,
    },
    /// Transient error, the controller's default error policy applies
    Error(Error),
    /// Nothing to do until the object changes, do not requeue
    Stop,
}

impl ActionResult {
    pub fn failed(error_type: ErrorType, error_count: i32) -> Self {
        Self::Failed {
            error_type,
            error_count,
        }
    }

    /// Whether the handler asked to move on to the next state
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn into_outcome(self, backoff: &Backoff) -> Result<ReconcileOutcome> {
        match self {
            Self::Continue(delay) => Ok(ReconcileOutcome {
                requeue_after: Some(delay),
                requeue_now: true,
            }),
            Self::Delayed => Ok(ReconcileOutcome::after(backoff.calculate(1))),
            Self::Complete => Ok(ReconcileOutcome::now()),
            Self::DeleteComplete | Self::Stop => Ok(ReconcileOutcome::done()),
            Self::Failed { error_count, .. } => {
                Ok(ReconcileOutcome::after(backoff.calculate(error_count)))
            }
            Self::Error(err) => Err(err),
        }
    }
}

impl From<Error> for ActionResult {
    fn from(err: Error) -> Self {
        Self::Error(err)
    }
}

/// Requeue directive handed back to the controller runtime
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub requeue_after: Option<Duration>,
    pub requeue_now: bool,
}

impl ReconcileOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn now() -> Self {
        Self {
            requeue_after: None,
            requeue_now: true,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
            requeue_now: false,
        }
    }

    pub fn into_action(self) -> Action {
        match (self.requeue_after, self.requeue_now) {
            (Some(delay), _) if !delay.is_zero() => Action::requeue(delay),
            (_, true) | (Some(_), false) => Action::requeue(Duration::from_millis(100)),
            (None, false) => Action::await_change(),
        }
    }
}
