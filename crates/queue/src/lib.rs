//! Business operations on pulses, each atomic with respect to the store.
//!
//! `mark_processing` is the ordering authority: the daemon must succeed at
//! it before handing a pulse to the executor. A lost compare-and-swap means
//! some other caller already claimed the pulse first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulse_domain::{Error, Priority, Pulse, PulseStatus, Result};
use pulse_store::Store;
use tracing::info;

pub struct Queue {
    store: Arc<Store>,
}

/// Inputs to `Queue::schedule`. Everything but `prompt` and `scheduled_at`
/// has a sensible default.
#[derive(Debug, Clone, Default)]
pub struct ScheduleParams {
    pub scheduled_at: Option<DateTime<Utc>>,
    pub prompt: String,
    pub priority: Option<Priority>,
    pub session_id: Option<String>,
    pub sticky_notes: Option<Vec<String>>,
    pub tags: Option<std::collections::BTreeSet<String>>,
    pub created_by: Option<String>,
    pub max_retries: Option<u32>,
}

impl Queue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// On daemon startup, reset any pulse left `PROCESSING` by a crashed
    /// prior run back to `PENDING`, incrementing `retry_count` exactly as
    /// an ordinary retry would — the only reconciliation rule this system
    /// defines, chosen because it guarantees a pulse never stays stuck
    /// PROCESSING forever. `threshold` bounds how old `claimed_at` must be
    /// before a still-PROCESSING pulse is considered orphaned rather than
    /// merely slow.
    pub async fn reconcile_orphaned(&self, threshold: chrono::Duration) -> Result<usize> {
        let now = Utc::now();
        let reset_ids = self
            .store
            .mutate(|inner| {
                let mut ids = Vec::new();
                // Collect candidate ids first; HashMap has no stable
                // iter_mut-while-filtering story we want to lean on here.
                let candidates: Vec<u64> = inner
                    .get_all_ids_with_status(PulseStatus::Processing)
                    .into_iter()
                    .filter(|id| {
                        inner
                            .get(*id)
                            .and_then(|p| p.claimed_at)
                            .map(|claimed| now - claimed >= threshold)
                            .unwrap_or(true)
                    })
                    .collect();
                for id in candidates {
                    if let Some(pulse) = inner.get_mut(id) {
                        pulse.status = PulseStatus::Pending;
                        pulse.retry_count += 1;
                        pulse.claimed_at = None;
                        ids.push(id);
                    }
                }
                ids
            })
            .await?;
        for id in &reset_ids {
            info!(pulse_id = id, "reconciled orphaned PROCESSING pulse to PENDING");
        }
        Ok(reset_ids.len())
    }

    pub fn schedule(&self, params: ScheduleParams) -> Result<ScheduleOutcome> {
        if params.prompt.trim().is_empty() {
            return Err(Error::Validation("prompt must not be empty".to_string()));
        }
        if params.prompt.chars().count() > pulse_domain::pulse::MAX_PROMPT_CHARS {
            return Err(Error::Validation(format!(
                "prompt exceeds {} characters",
                pulse_domain::pulse::MAX_PROMPT_CHARS
            )));
        }
        let max_retries = params.max_retries.unwrap_or(pulse_domain::pulse::default_max_retries());
        if max_retries == 0 {
            return Err(Error::Validation("max_retries must be positive".to_string()));
        }
        let scheduled_at = params.scheduled_at.unwrap_or_else(Utc::now);
        let priority = params.priority.unwrap_or_default();
        let created_by = params.created_by.unwrap_or_else(|| "system".to_string());
        let prompt = params.prompt.clone();
        Ok(ScheduleOutcome {
            id: 0,
            scheduled_at,
            priority,
            prompt,
            created_by,
            max_retries,
            sticky_notes: params.sticky_notes,
            tags: params.tags,
            session_id: params.session_id,
        })
    }

    /// Insert a validated pulse and return its assigned id. Split from
    /// `schedule` (which only validates + fills defaults) so the retry
    /// path below can reuse it without re-validating already-trusted data.
    pub async fn insert(&self, outcome: ScheduleOutcome) -> Result<u64> {
        let id = self
            .store
            .mutate(|inner| {
                let id = inner.allocate_id();
                inner.insert(Pulse {
                    id,
                    scheduled_at: outcome.scheduled_at,
                    prompt: outcome.prompt.clone(),
                    priority: outcome.priority,
                    status: PulseStatus::Pending,
                    session_id: outcome.session_id.clone(),
                    sticky_notes: outcome.sticky_notes.clone(),
                    tags: outcome.tags.clone(),
                    retry_count: 0,
                    max_retries: outcome.max_retries,
                    created_by: outcome.created_by.clone(),
                    created_at: Utc::now(),
                    claimed_at: None,
                    executed_at: None,
                    execution_duration_ms: None,
                    error_message: None,
                });
                id
            })
            .await?;
        info!(pulse_id = id, priority = ?outcome.priority, "pulse scheduled");
        Ok(id)
    }

    pub fn get_due(&self, limit: usize) -> Vec<Pulse> {
        self.store.list_due(Utc::now(), limit)
    }

    pub fn get_upcoming(&self, limit: usize, include_statuses: Option<Vec<PulseStatus>>) -> Vec<Pulse> {
        let statuses = include_statuses.unwrap_or_else(|| vec![PulseStatus::Pending]);
        self.store.list_upcoming(limit, &statuses)
    }

    pub fn get(&self, id: u64) -> Option<Pulse> {
        self.store.get(id)
    }

    /// Atomic CAS PENDING -> PROCESSING. Returns `false` without mutating
    /// anything if the pulse isn't PENDING (already claimed, cancelled,
    /// unknown, etc.) — the duplicate-execution guard.
    pub async fn mark_processing(&self, id: u64) -> Result<bool> {
        let claimed = self
            .store
            .mutate(|inner| match inner.get_mut(id) {
                Some(p) if p.status == PulseStatus::Pending => {
                    p.status = PulseStatus::Processing;
                    p.claimed_at = Some(Utc::now());
                    true
                }
                _ => false,
            })
            .await?;
        if claimed {
            info!(pulse_id = id, "pulse claimed");
        }
        Ok(claimed)
    }

    pub async fn mark_completed(&self, id: u64, duration_ms: u64) -> Result<bool> {
        let done = self
            .store
            .mutate(|inner| match inner.get_mut(id) {
                Some(p) if p.status == PulseStatus::Processing => {
                    p.status = PulseStatus::Completed;
                    p.executed_at = Some(Utc::now());
                    p.execution_duration_ms = Some(duration_ms);
                    true
                }
                _ => false,
            })
            .await?;
        if done {
            info!(pulse_id = id, duration_ms, "pulse completed");
        }
        Ok(done)
    }

    /// Transitions PROCESSING -> FAILED. When `should_retry` is true and
    /// the original pulse hasn't exhausted `max_retries`, spawns a new
    /// PENDING pulse (new id, `retry_count' = retry_count + 1`,
    /// `scheduled_at' = now + 2^retry_count minutes`), copying
    /// session_id/sticky_notes/tags/prompt/priority/max_retries verbatim
    /// and prefixing `created_by` with `retry_`. Returns the retry pulse's
    /// id, if one was created. No-op (returns `None`, no error) on an
    /// unknown id.
    pub async fn mark_failed(
        &self,
        id: u64,
        error_message: impl Into<String>,
        should_retry: bool,
    ) -> Result<Option<u64>> {
        let error_message = error_message.into();
        let outcome = self
            .store
            .mutate(move |inner| {
                let original = match inner.get_mut(id) {
                    Some(p) if p.status == PulseStatus::Processing => p,
                    _ => return None,
                };
                original.status = PulseStatus::Failed;
                original.executed_at = Some(Utc::now());
                original.error_message = Some(error_message.clone());
                original.claimed_at = None;

                let can_retry = should_retry && original.retry_count < original.max_retries;
                if !can_retry {
                    return Some(None);
                }

                let retry_count = original.retry_count;
                let backoff = Pulse::retry_backoff_minutes(retry_count);
                let retry = Pulse {
                    id: 0, // filled below
                    scheduled_at: Utc::now() + chrono::Duration::minutes(backoff),
                    prompt: original.prompt.clone(),
                    priority: original.priority,
                    status: PulseStatus::Pending,
                    session_id: original.session_id.clone(),
                    sticky_notes: original.sticky_notes.clone(),
                    tags: original.tags.clone(),
                    retry_count: retry_count + 1,
                    max_retries: original.max_retries,
                    created_by: Pulse::retry_created_by(&original.created_by),
                    created_at: Utc::now(),
                    claimed_at: None,
                    executed_at: None,
                    execution_duration_ms: None,
                    error_message: None,
                };
                let new_id = inner.allocate_id();
                let mut retry = retry;
                retry.id = new_id;
                inner.insert(retry);
                Some(Some(new_id))
            })
            .await?;

        match outcome {
            None => Ok(None), // unknown id or not PROCESSING: no-op
            Some(retry_id) => {
                info!(pulse_id = id, retry_id = ?retry_id, "pulse failed");
                Ok(retry_id)
            }
        }
    }

    /// PENDING -> CANCELLED. `false` on any non-PENDING pulse (including
    /// unknown ids and already-terminal pulses); never resurrects a
    /// terminal pulse.
    pub async fn cancel(&self, id: u64) -> Result<bool> {
        let cancelled = self
            .store
            .mutate(|inner| match inner.get_mut(id) {
                Some(p) if p.status == PulseStatus::Pending => {
                    p.status = PulseStatus::Cancelled;
                    true
                }
                _ => false,
            })
            .await?;
        if cancelled {
            info!(pulse_id = id, "pulse cancelled");
        }
        Ok(cancelled)
    }

    /// Updates `scheduled_at` iff the pulse is still PENDING.
    pub async fn reschedule(&self, id: u64, new_scheduled_at: DateTime<Utc>) -> Result<bool> {
        let rescheduled = self
            .store
            .mutate(|inner| match inner.get_mut(id) {
                Some(p) if p.status == PulseStatus::Pending => {
                    p.scheduled_at = new_scheduled_at;
                    true
                }
                _ => false,
            })
            .await?;
        if rescheduled {
            info!(pulse_id = id, "pulse rescheduled");
        }
        Ok(rescheduled)
    }

    pub fn counts_by_status(&self) -> std::collections::HashMap<PulseStatus, usize> {
        self.store.counts_by_status()
    }
}

/// Validated, default-filled inputs ready to be inserted by `Queue::insert`.
#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub id: u64,
    pub scheduled_at: DateTime<Utc>,
    pub priority: Priority,
    pub prompt: String,
    pub created_by: String,
    pub max_retries: u32,
    pub sticky_notes: Option<Vec<String>>,
    pub tags: Option<std::collections::BTreeSet<String>>,
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_queue() -> (Queue, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("pulse_queue.db")).unwrap());
        (Queue::new(store), dir)
    }

    #[tokio::test]
    async fn schedule_rejects_empty_prompt() {
        let (queue, _dir) = new_queue().await;
        let result = queue.schedule(ScheduleParams {
            prompt: "   ".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn schedule_rejects_zero_max_retries() {
        let (queue, _dir) = new_queue().await;
        let result = queue.schedule(ScheduleParams {
            prompt: "hi".to_string(),
            max_retries: Some(0),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn schedule_accepts_past_dated_scheduled_at() {
        let (queue, _dir) = new_queue().await;
        let past = Utc::now() - chrono::Duration::days(1);
        let outcome = queue
            .schedule(ScheduleParams {
                prompt: "hi".to_string(),
                scheduled_at: Some(past),
                ..Default::default()
            })
            .unwrap();
        let id = queue.insert(outcome).await.unwrap();
        let due = queue.get_due(10);
        assert!(due.iter().any(|p| p.id == id));
    }

    #[tokio::test]
    async fn mark_processing_is_at_most_once() {
        let (queue, _dir) = new_queue().await;
        let outcome = queue
            .schedule(ScheduleParams {
                prompt: "hi".to_string(),
                scheduled_at: Some(Utc::now()),
                ..Default::default()
            })
            .unwrap();
        let id = queue.insert(outcome).await.unwrap();

        let first = queue.mark_processing(id).await.unwrap();
        let second = queue.mark_processing(id).await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn mark_failed_spawns_retry_with_backoff() {
        let (queue, _dir) = new_queue().await;
        let outcome = queue
            .schedule(ScheduleParams {
                prompt: "hi".to_string(),
                scheduled_at: Some(Utc::now()),
                created_by: Some("reeve".to_string()),
                ..Default::default()
            })
            .unwrap();
        let id = queue.insert(outcome).await.unwrap();
        queue.mark_processing(id).await.unwrap();

        let before = Utc::now();
        let retry_id = queue.mark_failed(id, "boom", true).await.unwrap();
        assert!(retry_id.is_some());
        let retry = queue.get(retry_id.unwrap()).unwrap();
        assert_eq!(retry.status, PulseStatus::Pending);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.created_by, "retry_reeve");
        let expected = before + chrono::Duration::minutes(1);
        let delta = (retry.scheduled_at - expected).num_seconds().abs();
        assert!(delta < 5, "delta was {delta}s");

        let original = queue.get(id).unwrap();
        assert_eq!(original.status, PulseStatus::Failed);
    }

    #[tokio::test]
    async fn mark_failed_stops_at_max_retries() {
        let (queue, _dir) = new_queue().await;
        let outcome = queue
            .schedule(ScheduleParams {
                prompt: "hi".to_string(),
                scheduled_at: Some(Utc::now()),
                max_retries: Some(1),
                ..Default::default()
            })
            .unwrap();
        let id = queue.insert(outcome).await.unwrap();
        queue.mark_processing(id).await.unwrap();
        let retry_id = queue.mark_failed(id, "boom", true).await.unwrap().unwrap();

        queue.mark_processing(retry_id).await.unwrap();
        let second_retry = queue.mark_failed(retry_id, "boom again", true).await.unwrap();
        assert!(second_retry.is_none());
    }

    #[tokio::test]
    async fn cancel_only_affects_pending() {
        let (queue, _dir) = new_queue().await;
        let outcome = queue
            .schedule(ScheduleParams {
                prompt: "hi".to_string(),
                scheduled_at: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();
        let id = queue.insert(outcome).await.unwrap();

        assert!(queue.cancel(id).await.unwrap());
        assert!(!queue.cancel(id).await.unwrap());
        assert_eq!(queue.get(id).unwrap().status, PulseStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_does_not_affect_processing() {
        let (queue, _dir) = new_queue().await;
        let outcome = queue
            .schedule(ScheduleParams {
                prompt: "hi".to_string(),
                scheduled_at: Some(Utc::now()),
                ..Default::default()
            })
            .unwrap();
        let id = queue.insert(outcome).await.unwrap();
        queue.mark_processing(id).await.unwrap();

        assert!(!queue.cancel(id).await.unwrap());
        assert_eq!(queue.get(id).unwrap().status, PulseStatus::Processing);
    }

    #[tokio::test]
    async fn reconcile_orphaned_resets_processing_to_pending() {
        let (queue, _dir) = new_queue().await;
        let outcome = queue
            .schedule(ScheduleParams {
                prompt: "hi".to_string(),
                scheduled_at: Some(Utc::now()),
                ..Default::default()
            })
            .unwrap();
        let id = queue.insert(outcome).await.unwrap();
        queue.mark_processing(id).await.unwrap();

        let reset = queue.reconcile_orphaned(chrono::Duration::seconds(0)).await.unwrap();
        assert_eq!(reset, 1);
        let pulse = queue.get(id).unwrap();
        assert_eq!(pulse.status, PulseStatus::Pending);
        assert_eq!(pulse.retry_count, 1);
    }
}
