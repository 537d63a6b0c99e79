use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Priority class. Declaration order doubles as rank order (derived `Ord`),
/// so `Priority::Critical < Priority::High < ... < Priority::Deferred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Deferred,
}

impl Priority {
    /// Numeric rank, 0 (claims first) to 4 (claims last).
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Lifecycle state. Terminal states (`Completed`, `Failed`, `Cancelled`)
/// never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PulseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PulseStatus::Completed | PulseStatus::Failed | PulseStatus::Cancelled
        )
    }
}

/// A single scheduled invocation of the runner.
///
/// Store exclusively owns each pulse; every mutation goes through a Queue
/// operation. Copies handed out to the daemon, executor, and ingresses are
/// value snapshots, not handles into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    pub id: u64,
    pub scheduled_at: DateTime<Utc>,
    pub prompt: String,
    #[serde(default)]
    pub priority: Priority,
    pub status: PulseStatus,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sticky_notes: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// When this pulse last entered PROCESSING. Internal bookkeeping only
    /// (not part of the documented wire shape) used to detect pulses
    /// orphaned by a daemon crash on startup; never read by any ingress.
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_duration_ms: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub fn default_max_retries() -> u32 {
    3
}

/// Longest a prompt may be, in characters.
pub const MAX_PROMPT_CHARS: usize = 2000;
/// Longest a prompt excerpt may be in log lines, per the logging requirement.
pub const LOG_EXCERPT_CHARS: usize = 100;

impl Pulse {
    /// True iff this pulse can be claimed right now: PENDING and due.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == PulseStatus::Pending && self.scheduled_at <= now
    }

    /// Backoff for a retry spawned from this (failed) pulse's `retry_count`.
    /// `2^retry_count` minutes, per the retry-backoff invariant.
    pub fn retry_backoff_minutes(retry_count: u32) -> i64 {
        1i64 << retry_count.min(40) // guard against absurd shift overflow
    }

    /// A `created_by` for the prefix-tagged spawn.
    pub fn retry_created_by(original: &str) -> String {
        format!("retry_{original}")
    }

    /// Truncate the prompt to `LOG_EXCERPT_CHARS` characters for log lines.
    pub fn prompt_excerpt(&self) -> String {
        excerpt(&self.prompt, LOG_EXCERPT_CHARS)
    }
}

/// Truncate `s` to at most `max_chars` characters, respecting char
/// boundaries (never split a multi-byte character).
pub fn excerpt(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_order() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
        assert!(Priority::Low.rank() < Priority::Deferred.rank());
    }

    #[test]
    fn priority_serializes_lowercase() {
        let s = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(s, "\"critical\"");
    }

    #[test]
    fn status_terminal() {
        assert!(PulseStatus::Completed.is_terminal());
        assert!(PulseStatus::Failed.is_terminal());
        assert!(PulseStatus::Cancelled.is_terminal());
        assert!(!PulseStatus::Pending.is_terminal());
        assert!(!PulseStatus::Processing.is_terminal());
    }

    #[test]
    fn retry_backoff_doubles() {
        assert_eq!(Pulse::retry_backoff_minutes(0), 1);
        assert_eq!(Pulse::retry_backoff_minutes(1), 2);
        assert_eq!(Pulse::retry_backoff_minutes(2), 4);
        assert_eq!(Pulse::retry_backoff_minutes(3), 8);
    }

    #[test]
    fn retry_created_by_prefixes() {
        assert_eq!(Pulse::retry_created_by("reeve"), "retry_reeve");
        assert_eq!(Pulse::retry_created_by("http:chat"), "retry_http:chat");
    }

    #[test]
    fn excerpt_respects_char_boundary() {
        let s = "a".repeat(50) + "💡💡💡💡💡💡";
        let e = excerpt(&s, 52);
        assert!(e.chars().count() <= 53);
    }

    #[test]
    fn excerpt_short_string_unchanged() {
        assert_eq!(excerpt("short", 100), "short");
    }

    #[test]
    fn pulse_round_trips_through_json_with_missing_optional_fields() {
        // Backward-compat: a pulse serialized before `tags` existed should
        // still deserialize (tags absent -> None).
        let raw = serde_json::json!({
            "id": 1,
            "scheduled_at": "2024-01-01T00:00:00Z",
            "prompt": "hello",
            "status": "pending",
            "created_by": "system",
            "created_at": "2024-01-01T00:00:00Z"
        });
        let p: Pulse = serde_json::from_value(raw).unwrap();
        assert_eq!(p.priority, Priority::Normal);
        assert_eq!(p.max_retries, 3);
        assert!(p.tags.is_none());
        assert!(p.sticky_notes.is_none());
    }

    #[test]
    fn pulse_preserves_nonzero_utc_offset_round_trip() {
        let dt = DateTime::parse_from_rfc3339("2024-06-01T10:00:00+05:30")
            .unwrap()
            .with_timezone(&Utc);
        let p = Pulse {
            id: 1,
            scheduled_at: dt,
            prompt: "x".into(),
            priority: Priority::Normal,
            status: PulseStatus::Pending,
            session_id: None,
            sticky_notes: None,
            tags: None,
            retry_count: 0,
            max_retries: 3,
            created_by: "system".into(),
            created_at: dt,
            claimed_at: None,
            executed_at: None,
            execution_duration_ms: None,
            error_message: None,
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: Pulse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scheduled_at, dt);
    }
}
