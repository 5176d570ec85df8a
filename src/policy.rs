//! Retry policies: per-hop delay schedules and in-place backoff
//!
//! [`DelayPolicy`] drives the non-blocking path: it fixes the delay of each
//! retry hop deterministically, which is what makes topic names and due
//! times reproducible. [`RetryPolicy`] drives in-place retries (blocking
//! strategy, publish retries): it is jittered and bounded.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::debug;

/// Maximum allowed retry attempts to prevent DoS
const MAX_RETRY_ATTEMPTS: u32 = 1000;
/// Maximum backoff duration to prevent excessive delays
const MAX_BACKOFF_SECONDS: u64 = 3600; // 1 hour
/// Maximum multiplier to prevent exponential explosion
const MAX_MULTIPLIER: f64 = 100.0;
/// Maximum jitter factor
const MAX_JITTER_FACTOR: f64 = 1.0;

/// Validate retry count within reasonable bounds
fn validate_max_retries<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u32::deserialize(deserializer)?;
    if value > MAX_RETRY_ATTEMPTS {
        return Err(serde::de::Error::custom(format!(
            "max_retries {} exceeds maximum allowed value {}",
            value, MAX_RETRY_ATTEMPTS
        )));
    }
    Ok(value)
}

/// Validate backoff duration within reasonable bounds
fn validate_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let duration = Duration::deserialize(deserializer)?;
    if duration.as_secs() > MAX_BACKOFF_SECONDS {
        return Err(serde::de::Error::custom(format!(
            "duration {:?} exceeds maximum allowed {} seconds",
            duration, MAX_BACKOFF_SECONDS
        )));
    }
    Ok(duration)
}

/// Validate multiplier within reasonable bounds
fn validate_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 || value > MAX_MULTIPLIER {
        return Err(serde::de::Error::custom(format!(
            "multiplier {} must be finite and between 0.0 and {}",
            value, MAX_MULTIPLIER
        )));
    }
    Ok(value)
}

/// Validate jitter factor within bounds [0.0, 1.0]
fn validate_jitter<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 || value > MAX_JITTER_FACTOR {
        return Err(serde::de::Error::custom(format!(
            "jitter_factor {} must be finite and between 0.0 and {}",
            value, MAX_JITTER_FACTOR
        )));
    }
    Ok(value)
}

/// Deterministic per-hop delay schedule for the retry topic chain.
///
/// No jitter on purpose: the delay of hop `n` is part of the topic naming
/// and due-time contract, so two processes configured alike must compute
/// the same series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelayPolicy {
    /// Same delay before every retry hop
    Fixed {
        /// Delay applied to each hop
        #[serde(deserialize_with = "validate_duration")]
        delay: Duration,
    },
    /// Delay grows by `multiplier` each hop, capped at `max`
    Exponential {
        /// Delay of the first retry hop
        #[serde(deserialize_with = "validate_duration")]
        initial: Duration,
        /// Growth factor between hops
        #[serde(deserialize_with = "validate_multiplier")]
        multiplier: f64,
        /// Upper bound on any hop's delay
        #[serde(deserialize_with = "validate_duration")]
        max: Duration,
    },
}

impl Default for DelayPolicy {
    fn default() -> Self {
        DelayPolicy::Fixed {
            delay: Duration::from_secs(1),
        }
    }
}

impl DelayPolicy {
    /// Exponential schedule with the conventional doubling factor.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        DelayPolicy::Exponential {
            initial,
            multiplier: 2.0,
            max,
        }
    }

    /// Delay before the retry hop at the given zero-based position.
    pub fn delay_for(&self, hop: usize) -> Duration {
        match self {
            DelayPolicy::Fixed { delay } => *delay,
            DelayPolicy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                // Same overflow guard as the jittered policy below: past
                // 30 doublings every schedule has hit its cap.
                let factor = if hop > 30 {
                    f64::INFINITY
                } else {
                    multiplier.powf(hop as f64)
                };
                if !factor.is_finite() {
                    return *max;
                }
                let delay = Duration::from_secs_f64(initial.as_secs_f64() * factor);
                delay.min(*max)
            }
        }
    }

    /// The full delay series for a chain with `hops` retry hops.
    pub fn series(&self, hops: usize) -> Vec<Duration> {
        (0..hops).map(|hop| self.delay_for(hop)).collect()
    }
}

/// Retry policy configuration with validated bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries
    #[serde(deserialize_with = "validate_max_retries")]
    pub max_retries: u32,
    /// Initial backoff duration
    #[serde(deserialize_with = "validate_duration")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(deserialize_with = "validate_duration")]
    pub max_backoff: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential)
    #[serde(deserialize_with = "validate_multiplier")]
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(deserialize_with = "validate_jitter")]
    pub jitter_factor: f64,
    /// Whether to use exponential backoff
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            exponential: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate the next backoff duration
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_backoff = if self.exponential {
            // Use safe multiplier calculation to prevent overflow
            let safe_multiplier = if attempt > 30 {
                // For very high attempts, just use max backoff
                self.max_backoff.as_secs_f64() / self.initial_backoff.as_secs_f64()
            } else {
                // Calculate power safely using f64
                let multiplier = self.backoff_multiplier.powf((attempt as i32 - 1) as f64);
                // Ensure multiplier is finite and reasonable
                if multiplier.is_finite() && multiplier < 1e6 {
                    multiplier
                } else {
                    self.max_backoff.as_secs_f64() / self.initial_backoff.as_secs_f64()
                }
            };
            Duration::from_secs_f64(self.initial_backoff.as_secs_f64() * safe_multiplier)
        } else {
            self.initial_backoff
        };

        // Cap at maximum backoff
        let capped_backoff = base_backoff.min(self.max_backoff);

        // Add jitter
        let jitter = capped_backoff.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
        let with_jitter = Duration::from_secs_f64(capped_backoff.as_secs_f64() + jitter);

        debug!(
            "Calculated backoff for attempt {}: {:?} (base: {:?})",
            attempt, with_jitter, base_backoff
        );

        with_jitter
    }

    /// Check if we should retry
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed backoff
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: backoff,
            max_backoff: backoff,
            exponential: false,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Create a policy with exponential backoff
    pub fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff: initial,
            max_backoff: max,
            exponential: true,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_policy_fixed_series() {
        let policy = DelayPolicy::Fixed {
            delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(7), Duration::from_millis(500));
        assert_eq!(
            policy.series(3),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn test_delay_policy_exponential_series() {
        let policy = DelayPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(
            policy.series(4),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5), // capped
            ]
        );
    }

    #[test]
    fn test_delay_policy_is_deterministic() {
        let policy = DelayPolicy::exponential(Duration::from_millis(100), Duration::from_secs(30));
        assert_eq!(policy.series(6), policy.series(6));
    }

    #[test]
    fn test_delay_policy_caps_huge_hop_numbers() {
        let policy = DelayPolicy::exponential(Duration::from_millis(100), Duration::from_secs(30));
        assert_eq!(policy.delay_for(31), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_policy_deserialization() {
        let fixed_json = r#"{"type": "fixed", "delay": {"secs": 2, "nanos": 0}}"#;
        let policy: DelayPolicy = serde_json::from_str(fixed_json).unwrap();
        assert_eq!(
            policy,
            DelayPolicy::Fixed {
                delay: Duration::from_secs(2)
            }
        );

        let too_long_json = r#"{"type": "fixed", "delay": {"secs": 7200, "nanos": 0}}"#;
        let policy: Result<DelayPolicy, _> = serde_json::from_str(too_long_json);
        assert!(policy.is_err());
    }

    #[test]
    fn test_exponential_backoff() {
        let policy =
            RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        // First attempt has no backoff
        assert_eq!(policy.next_backoff(0), Duration::ZERO);

        // Subsequent attempts have exponential backoff
        let backoff1 = policy.next_backoff(1);
        assert!(backoff1 >= Duration::from_millis(100));
        assert!(backoff1 < Duration::from_millis(200)); // With jitter

        let backoff2 = policy.next_backoff(2);
        assert!(backoff2 >= Duration::from_millis(200));
        assert!(backoff2 < Duration::from_millis(400)); // With jitter
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.next_backoff(0), Duration::ZERO);
        assert_eq!(policy.next_backoff(1), Duration::from_millis(500));
        assert_eq!(policy.next_backoff(2), Duration::from_millis(500));
        assert_eq!(policy.next_backoff(3), Duration::from_millis(500));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3)); // max_retries is 3
    }

    #[test]
    fn test_retry_policy_validation() {
        // Test valid configuration
        let valid_json = r#"
        {
            "max_retries": 5,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 0.1,
            "exponential": true
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(valid_json);
        assert!(policy.is_ok());

        // Test invalid max_retries (too high)
        let invalid_retries_json = r#"
        {
            "max_retries": 10000,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 0.1,
            "exponential": true
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(invalid_retries_json);
        assert!(policy.is_err());

        // Test invalid backoff duration (too long)
        let invalid_duration_json = r#"
        {
            "max_retries": 5,
            "initial_backoff": {"secs": 7200, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 0.1,
            "exponential": true
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(invalid_duration_json);
        assert!(policy.is_err());

        // Test invalid multiplier (negative)
        let invalid_multiplier_json = r#"
        {
            "max_retries": 5,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": -1.0,
            "jitter_factor": 0.1,
            "exponential": true
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(invalid_multiplier_json);
        assert!(policy.is_err());

        // Test invalid jitter factor (> 1.0)
        let invalid_jitter_json = r#"
        {
            "max_retries": 5,
            "initial_backoff": {"secs": 1, "nanos": 0},
            "max_backoff": {"secs": 30, "nanos": 0},
            "backoff_multiplier": 2.0,
            "jitter_factor": 1.5,
            "exponential": true
        }"#;

        let policy: Result<RetryPolicy, _> = serde_json::from_str(invalid_jitter_json);
        assert!(policy.is_err());
    }
}
