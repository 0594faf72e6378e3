//! Optimistic read-modify-write over an [`ObjectStore`]
//!
//! Every state transition in the engine goes through [`modify`]: clone the
//! last known object, apply a mutation, compare-and-set, and on a version
//! conflict re-read and re-apply. The mutation therefore must be a pure
//! function of the object data it is handed.

use converge_core::error::Result;
use converge_core::{ObjectData, ObjectStore, StoredObject};
use std::time::Duration;
use tracing::debug;

/// Configuration for compare-and-set retry behavior
///
/// # Example
/// ```
/// use converge_storage::RetryConfig;
///
/// let config = RetryConfig::new()
///     .with_max_retries(5)
///     .with_base_delay_ms(1)
///     .with_max_delay_ms(20);
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 16,
            base_delay_ms: 1,
            max_delay_ms: 50,
        }
    }
}

impl RetryConfig {
    /// Create a RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Calculate delay for a given attempt (exponential backoff)
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        // Cap the shift to prevent overflow (1 << 63 is the max for u64)
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Apply `f` to `obj` and write it back with compare-and-set
///
/// `f` returns a result value and whether anything changed. When nothing
/// changed no write happens. On `Outdated` the object is re-read, `f` is
/// applied again and the write retried, up to `retry.max_retries` times.
/// On success `obj` holds the stored state, including its new version.
///
/// # Errors
///
/// Any store error other than a retried `Outdated`; `Outdated` itself once
/// retries are exhausted.
pub fn modify<S, R, F>(store: &S, obj: &mut StoredObject, retry: &RetryConfig, mut f: F) -> Result<R>
where
    S: ObjectStore + ?Sized,
    F: FnMut(&mut ObjectData) -> (R, bool),
{
    let mut attempt = 0;
    loop {
        let mut candidate = obj.clone();
        let (result, changed) = f(&mut candidate.data);
        if !changed {
            return Ok(result);
        }
        match store.set_object(&candidate) {
            Ok(version) => {
                candidate.version = version;
                *obj = candidate;
                return Ok(result);
            }
            Err(e) if e.is_outdated() && attempt < retry.max_retries => {
                debug!(target: "converge::store", object = %obj.id, attempt, "outdated, retrying");
                let delay = retry.calculate_delay(attempt);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
                *obj = store.get_object(&obj.id)?;
            }
            Err(e) => return Err(e),
        }
    }
}
