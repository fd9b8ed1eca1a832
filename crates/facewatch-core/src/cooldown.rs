//! Event deduplication policy.
//!
//! A lingering face must not produce a capture every frame, yet a different
//! identity appearing right after must be reported immediately. The policy is
//! a pure function over [`CooldownState`] so it can be tested on its own.

use crate::types::MatchKey;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_INTERVAL_MS: u64 = 3000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownState {
    pub last_event_timestamp_ms: Option<u64>,
    pub last_event_key: Option<MatchKey>,
    pub min_interval_ms: u64,
}

impl CooldownState {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            last_event_timestamp_ms: None,
            last_event_key: None,
            min_interval_ms,
        }
    }
}

impl Default for CooldownState {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL_MS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownDecision {
    pub emit: bool,
    /// State to keep after this decision; unchanged when `emit` is false.
    pub next: CooldownState,
}

/// Decide whether an event for `key` at `now_ms` should be emitted.
///
/// Emits when nothing has been emitted yet, when the key differs from the
/// last emitted key, or when at least `min_interval_ms` has elapsed. A clock
/// that runs backwards counts as zero elapsed time.
pub fn decide(state: &CooldownState, key: &MatchKey, now_ms: u64) -> CooldownDecision {
    let emit = match (state.last_event_timestamp_ms, &state.last_event_key) {
        (Some(last), Some(last_key)) => {
            let elapsed = now_ms.saturating_sub(last);
            elapsed >= state.min_interval_ms || last_key != key
        }
        _ => true,
    };

    let next = if emit {
        CooldownState {
            last_event_timestamp_ms: Some(now_ms),
            last_event_key: Some(key.clone()),
            min_interval_ms: state.min_interval_ms,
        }
    } else {
        state.clone()
    };

    CooldownDecision { emit, next }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str) -> MatchKey {
        MatchKey::Person(id.into())
    }

    #[test]
    fn test_first_event_emits() {
        let d = decide(&CooldownState::new(3000), &person("a"), 0);
        assert!(d.emit);
        assert_eq!(d.next.last_event_timestamp_ms, Some(0));
        assert_eq!(d.next.last_event_key, Some(person("a")));
    }

    #[test]
    fn test_same_key_within_interval_suppressed() {
        let s = decide(&CooldownState::new(3000), &person("a"), 1000).next;
        let d = decide(&s, &person("a"), 3999);
        assert!(!d.emit);
        assert_eq!(d.next, s, "suppression leaves state untouched");
    }

    #[test]
    fn test_same_key_at_interval_emits() {
        let s = decide(&CooldownState::new(3000), &person("a"), 1000).next;
        let d = decide(&s, &person("a"), 4000);
        assert!(d.emit);
        assert_eq!(d.next.last_event_timestamp_ms, Some(4000));
    }

    #[test]
    fn test_key_change_overrides_cooldown() {
        let s = decide(&CooldownState::new(3000), &person("a"), 1000).next;
        let d = decide(&s, &person("b"), 1010);
        assert!(d.emit);
        assert_eq!(d.next.last_event_key, Some(person("b")));

        let d = decide(&d.next, &MatchKey::Unknown, 1020);
        assert!(d.emit);
    }

    #[test]
    fn test_suppressed_events_do_not_extend_cooldown() {
        let s = decide(&CooldownState::new(3000), &person("a"), 0).next;
        let s = decide(&s, &person("a"), 2000).next;
        assert!(decide(&s, &person("a"), 3000).emit);
    }

    #[test]
    fn test_clock_going_backwards_counts_as_zero_elapsed() {
        let s = decide(&CooldownState::new(3000), &person("a"), 10_000).next;
        assert!(!decide(&s, &person("a"), 5_000).emit);
    }

    #[test]
    fn test_zero_interval_always_emits() {
        let s = decide(&CooldownState::new(0), &person("a"), 5).next;
        assert!(decide(&s, &person("a"), 5).emit);
    }
}
