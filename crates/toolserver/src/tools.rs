//! The four tools exposed over stdio, each a thin wrapper over `Queue`.
//! Domain-level refusals ("pulse already completed") are returned as
//! successful RPC results carrying refusal text, never as JSON-RPC errors —
//! those are reserved for protocol-level problems (bad method, bad params).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pulse_domain::{Priority, PulseStatus};
use pulse_queue::{Queue, ScheduleParams};
use pulse_protocol::JsonRpcError;
use serde_json::Value;

pub struct ToolContext {
    pub queue: Arc<Queue>,
    /// Host-provided session id, if the calling agent host supplied one.
    /// Used only by `schedule_pulse`'s `resume_in_current_session` flag.
    pub host_session_id: Option<String>,
}

pub async fn dispatch(ctx: &ToolContext, method: &str, params: Option<Value>) -> Result<String, JsonRpcError> {
    let params = params.unwrap_or(Value::Null);
    match method {
        "schedule_pulse" => schedule_pulse(ctx, params).await,
        "list_upcoming_pulses" => list_upcoming_pulses(ctx, params),
        "cancel_pulse" => cancel_pulse(ctx, params).await,
        "reschedule_pulse" => reschedule_pulse(ctx, params).await,
        other => Err(JsonRpcError::method_not_found(other)),
    }
}

fn get_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

async fn schedule_pulse(ctx: &ToolContext, params: Value) -> Result<String, JsonRpcError> {
    let scheduled_at_raw =
        get_str(&params, "scheduled_at").ok_or_else(|| JsonRpcError::invalid_params("scheduled_at is required"))?;
    let prompt = get_str(&params, "prompt").ok_or_else(|| JsonRpcError::invalid_params("prompt is required"))?;
    let priority = match params.get("priority").and_then(Value::as_str) {
        Some(s) => parse_priority(s)?,
        None => Priority::Normal,
    };
    let resume_in_current_session = params
        .get("resume_in_current_session")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let sticky_notes = params.get("sticky_notes").and_then(|v| {
        v.as_array().map(|a| a.iter().filter_map(|e| e.as_str().map(str::to_string)).collect())
    });
    let tags = params.get("tags").and_then(|v| {
        v.as_array()
            .map(|a| a.iter().filter_map(|e| e.as_str().map(str::to_string)).collect())
    });

    // `resume_in_current_session: true` with no host session id available
    // silently behaves like `false` rather than erroring, matching the
    // precedent this system follows for that edge case.
    let session_id = if resume_in_current_session {
        ctx.host_session_id.clone()
    } else {
        None
    };

    let now = Utc::now();
    let scheduled_at = pulse_time::resolve(&scheduled_at_raw, now)
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

    let outcome = ctx
        .queue
        .schedule(ScheduleParams {
            scheduled_at: Some(scheduled_at),
            prompt,
            priority: Some(priority),
            session_id,
            sticky_notes,
            tags,
            created_by: Some("tool".to_string()),
            max_retries: None,
        })
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

    let id = ctx
        .queue
        .insert(outcome)
        .await
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

    Ok(format!(
        "Scheduled pulse #{id} for {} ({priority:?}).",
        scheduled_at.to_rfc3339()
    ))
}

fn parse_priority(s: &str) -> Result<Priority, JsonRpcError> {
    match s.to_lowercase().as_str() {
        "critical" => Ok(Priority::Critical),
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        "low" => Ok(Priority::Low),
        "deferred" => Ok(Priority::Deferred),
        other => Err(JsonRpcError::invalid_params(format!("unknown priority {other:?}"))),
    }
}

fn list_upcoming_pulses(ctx: &ToolContext, params: Value) -> Result<String, JsonRpcError> {
    let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(20).clamp(1, 100) as usize;
    let include_completed = params.get("include_completed").and_then(Value::as_bool).unwrap_or(false);

    let mut statuses = vec![PulseStatus::Pending, PulseStatus::Processing];
    if include_completed {
        statuses.push(PulseStatus::Completed);
        statuses.push(PulseStatus::Failed);
        statuses.push(PulseStatus::Cancelled);
    }

    let pulses = ctx.queue.get_upcoming(limit, Some(statuses));
    if pulses.is_empty() {
        return Ok("No upcoming pulses.".to_string());
    }

    let now = Utc::now();
    let mut out = String::from("id  | when       | priority | status     | prompt\n");
    for p in &pulses {
        out.push_str(&format!(
            "{:<4}| {:<11}| {:<9}| {:<11}| {}\n",
            p.id,
            relative_time(p.scheduled_at, now),
            format!("{:?}", p.priority),
            format!("{:?}", p.status),
            pulse_domain::pulse::excerpt(&p.prompt, 60),
        ));
    }
    Ok(out)
}

fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = at - now;
    if delta.num_seconds() < 0 {
        return "OVERDUE".to_string();
    }
    if delta.num_hours() >= 24 {
        return at.format("%Y-%m-%d %H:%M UTC").to_string();
    }
    if delta.num_hours() >= 1 {
        return format!("in {}h", delta.num_hours());
    }
    if delta.num_minutes() >= 1 {
        return format!("in {}m", delta.num_minutes());
    }
    format!("in {}s", delta.num_seconds())
}

async fn cancel_pulse(ctx: &ToolContext, params: Value) -> Result<String, JsonRpcError> {
    let pulse_id = get_u64(&params, "pulse_id").ok_or_else(|| JsonRpcError::invalid_params("pulse_id is required"))?;
    if pulse_id == 0 {
        return Err(JsonRpcError::invalid_params("pulse_id must be > 0"));
    }
    match ctx.queue.get(pulse_id) {
        None => Ok(format!("No such pulse #{pulse_id}.")),
        Some(p) if p.status != PulseStatus::Pending => Ok(format!(
            "Cannot cancel pulse #{pulse_id}: it is already {:?}.",
            p.status
        )),
        Some(_) => {
            let cancelled = ctx
                .queue
                .cancel(pulse_id)
                .await
                .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
            if cancelled {
                Ok(format!("Cancelled pulse #{pulse_id}."))
            } else {
                Ok(format!("Cannot cancel pulse #{pulse_id}: it changed state before the request landed."))
            }
        }
    }
}

async fn reschedule_pulse(ctx: &ToolContext, params: Value) -> Result<String, JsonRpcError> {
    let pulse_id = get_u64(&params, "pulse_id").ok_or_else(|| JsonRpcError::invalid_params("pulse_id is required"))?;
    let new_scheduled_at_raw = get_str(&params, "new_scheduled_at")
        .ok_or_else(|| JsonRpcError::invalid_params("new_scheduled_at is required"))?;
    let now = Utc::now();
    let new_scheduled_at = pulse_time::resolve(&new_scheduled_at_raw, now)
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;

    match ctx.queue.get(pulse_id) {
        None => Ok(format!("No such pulse #{pulse_id}.")),
        Some(p) if p.status != PulseStatus::Pending => Ok(format!(
            "Cannot reschedule pulse #{pulse_id}: it is already {:?}.",
            p.status
        )),
        Some(_) => {
            let rescheduled = ctx
                .queue
                .reschedule(pulse_id, new_scheduled_at)
                .await
                .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
            if rescheduled {
                Ok(format!(
                    "Rescheduled pulse #{pulse_id} to {}.",
                    new_scheduled_at.to_rfc3339()
                ))
            } else {
                Ok(format!(
                    "Cannot reschedule pulse #{pulse_id}: it changed state before the request landed."
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_store::Store;
    use serde_json::json;

    async fn ctx() -> (ToolContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("db.json")).unwrap());
        let queue = Arc::new(Queue::new(store));
        (
            ToolContext {
                queue,
                host_session_id: None,
            },
            dir,
        )
    }

    #[tokio::test]
    async fn schedule_pulse_round_trips() {
        let (ctx, _dir) = ctx().await;
        let result = dispatch(&ctx, "schedule_pulse", Some(json!({ "scheduled_at": "now", "prompt": "hi" })))
            .await
            .unwrap();
        assert!(result.contains("Scheduled pulse #1"));
    }

    #[tokio::test]
    async fn schedule_pulse_rejects_bad_priority() {
        let (ctx, _dir) = ctx().await;
        let result = dispatch(
            &ctx,
            "schedule_pulse",
            Some(json!({ "scheduled_at": "now", "prompt": "hi", "priority": "urgent" })),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_pulse_reports_refusal_as_value_not_error() {
        let (ctx, _dir) = ctx().await;
        dispatch(&ctx, "schedule_pulse", Some(json!({ "scheduled_at": "now", "prompt": "hi" })))
            .await
            .unwrap();
        let first = dispatch(&ctx, "cancel_pulse", Some(json!({ "pulse_id": 1 }))).await.unwrap();
        assert!(first.contains("Cancelled"));
        let second = dispatch(&ctx, "cancel_pulse", Some(json!({ "pulse_id": 1 }))).await.unwrap();
        assert!(second.contains("Cannot cancel"));
    }

    #[tokio::test]
    async fn cancel_pulse_unknown_id_is_a_value_not_an_error() {
        let (ctx, _dir) = ctx().await;
        let result = dispatch(&ctx, "cancel_pulse", Some(json!({ "pulse_id": 999 }))).await.unwrap();
        assert!(result.contains("No such pulse"));
    }

    #[tokio::test]
    async fn unknown_method_is_a_protocol_error() {
        let (ctx, _dir) = ctx().await;
        let result = dispatch(&ctx, "delete_everything", None).await;
        assert!(result.is_err());
    }

    #[test]
    fn relative_time_buckets() {
        let now = Utc::now();
        assert_eq!(relative_time(now - chrono::Duration::seconds(1), now), "OVERDUE");
        assert_eq!(relative_time(now + chrono::Duration::minutes(5), now), "in 5m");
        assert_eq!(relative_time(now + chrono::Duration::hours(2), now), "in 2h");
    }
}
