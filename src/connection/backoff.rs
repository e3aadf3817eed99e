// src/connection/backoff.rs

//! Delay policies applied between reconnection attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// Exponent cap so `base * 2^attempt` cannot overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// A user-supplied delay function. It receives the zero-based retry attempt.
#[derive(Clone)]
pub struct BackoffFn(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl BackoffFn {
    pub fn new(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for BackoffFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackoffFn(..)")
    }
}

/// How long to wait before retry attempt `n`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// `base * 2^attempt`, capped at `max`, plus up to `base / 2` of random jitter.
    Exponential {
        #[serde(with = "humantime_serde", default = "default_base")]
        base: Duration,
        #[serde(with = "humantime_serde", default = "default_max")]
        max: Duration,
        #[serde(default = "default_jitter")]
        jitter: bool,
    },
    /// The same delay before every attempt.
    Constant {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Retry immediately.
    None,
    /// A programmatic policy; cannot be expressed in a config file.
    #[serde(skip)]
    Custom(BackoffFn),
}

fn default_base() -> Duration {
    Duration::from_millis(100)
}
fn default_max() -> Duration {
    Duration::from_secs(10)
}
fn default_jitter() -> bool {
    true
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: default_base(),
            max: default_max(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    /// Wraps a closure as a policy.
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        BackoffPolicy::Custom(BackoffFn::new(f))
    }

    /// The delay to sleep before retry `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Exponential { base, max, jitter } => {
                let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
                let delay = base.saturating_mul(factor).min(*max);
                let half_base = (base.as_millis() / 2) as u64;
                if *jitter && half_base > 0 {
                    let extra = rand::thread_rng().gen_range(0..=half_base);
                    delay.saturating_add(Duration::from_millis(extra))
                } else {
                    delay
                }
            }
            BackoffPolicy::Constant { delay } => *delay,
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Custom(f) => (f.0)(attempt),
        }
    }
}
