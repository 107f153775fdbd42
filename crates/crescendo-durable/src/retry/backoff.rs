//! Backoff policy implementations

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped exponential backoff for saga step retries
///
/// `delay_for_attempt(n) = min(cap, base * 2^n)` where `n` is the number of
/// attempts made so far.
///
/// # Example
///
/// ```
/// use crescendo_durable::StepBackoff;
/// use std::time::Duration;
///
/// let backoff = StepBackoff::default();
///
/// assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
/// assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepBackoff {
    /// Base delay, doubled per attempt
    #[serde(with = "duration_millis")]
    pub base: Duration,

    /// Upper bound on the computed delay
    #[serde(with = "duration_millis")]
    pub cap: Duration,
}

impl Default for StepBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
        }
    }
}

impl StepBackoff {
    /// Create a backoff policy with the given base and cap
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Set the base delay
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    /// Set the delay cap
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Delay before the retry following `attempt` failed attempts
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(32);
        let raw = self
            .base
            .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        raw.min(self.cap)
    }
}

/// Fixed-table backoff for event delivery retries
///
/// `delay_for_attempt(n) = table[min(n, len - 1)]`. Past the end of the
/// table the delay plateaus at the last entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventBackoff {
    /// Delay table indexed by attempts made so far; kept private so an
    /// empty table cannot be constructed around the `new` guard
    #[serde(with = "duration_millis_vec")]
    table: Vec<Duration>,
}

impl Default for EventBackoff {
    fn default() -> Self {
        Self {
            table: vec![
                Duration::from_secs(1),
                Duration::from_secs(4),
                Duration::from_secs(16),
            ],
        }
    }
}

impl EventBackoff {
    /// Create a backoff policy from a delay table
    ///
    /// The table must be non-empty; an empty table falls back to the
    /// default.
    pub fn new(table: Vec<Duration>) -> Self {
        if table.is_empty() {
            Self::default()
        } else {
            Self { table }
        }
    }

    /// The delay table
    pub fn table(&self) -> &[Duration] {
        &self.table
    }

    /// Delay before the retry following `attempt` failed attempts
    ///
    /// Total even for an empty table (reachable via deserialization):
    /// behaves as the default table.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.table.last() {
            Some(last) => *self.table.get(attempt as usize).unwrap_or(last),
            None => Self::default().delay_for_attempt(attempt),
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Vec<Duration> as milliseconds
mod duration_millis_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        durations
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_backoff_doubles() {
        let backoff = StepBackoff::default();

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_step_backoff_monotonic_and_capped() {
        let backoff = StepBackoff::default().with_cap(Duration::from_secs(10));

        let mut prev = Duration::ZERO;
        for attempt in 0..20 {
            let delay = backoff.delay_for_attempt(attempt);
            assert!(delay >= prev, "delay must not decrease");
            assert!(delay <= Duration::from_secs(10));
            prev = delay;
        }

        // Plateaus at the cap
        assert_eq!(backoff.delay_for_attempt(30), Duration::from_secs(10));
    }

    #[test]
    fn test_step_backoff_large_attempt_does_not_overflow() {
        let backoff = StepBackoff::default();
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_event_backoff_table() {
        let backoff = EventBackoff::default();

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(16));
    }

    #[test]
    fn test_event_backoff_clamps_past_table() {
        let backoff = EventBackoff::default();

        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(16));
        assert_eq!(backoff.delay_for_attempt(100), Duration::from_secs(16));
    }

    #[test]
    fn test_event_backoff_rejects_empty_table() {
        let backoff = EventBackoff::new(vec![]);
        assert_eq!(backoff.table().len(), 3);
    }

    #[test]
    fn test_event_backoff_deserialized_empty_table_does_not_panic() {
        // Deserialization bypasses the constructor guard
        let backoff: EventBackoff = serde_json::from_str(r#"{"table": []}"#).unwrap();

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(100), Duration::from_secs(16));
    }

    #[test]
    fn test_serialization_round_trip() {
        let step = StepBackoff::default().with_cap(Duration::from_secs(30));
        let json = serde_json::to_string(&step).unwrap();
        let parsed: StepBackoff = serde_json::from_str(&json).unwrap();
        assert_eq!(step, parsed);

        let event = EventBackoff::default();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: EventBackoff = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
