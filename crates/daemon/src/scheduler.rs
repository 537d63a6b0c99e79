//! The scheduling loop: once a tick, claim due pulses up to the in-flight
//! cap, hand each to the executor as a concurrent task, and report the
//! outcome back through the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pulse_domain::Pulse;
use pulse_executor::{ExecuteRequest, Executor, ExecutorError};
use pulse_queue::Queue;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::concurrency::ConcurrencyGuard;
use crate::shutdown::Shutdown;

pub struct SchedulerConfig {
    pub tick: Duration,
    pub batch_limit: usize,
    pub shutdown_grace: Duration,
    pub executor_timeout: Duration,
    pub desk_path: PathBuf,
}

pub async fn run(
    config: SchedulerConfig,
    queue: Arc<Queue>,
    executor: Arc<Executor>,
    concurrency: Arc<ConcurrencyGuard>,
    shutdown: Arc<Shutdown>,
) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        if shutdown.is_triggered() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(config.tick) => {}
            _ = shutdown.wait() => { break; }
        }

        // Drain any tasks that finished since the last tick so `in_flight`
        // doesn't grow without bound across the run.
        while in_flight.try_join_next().is_some() {}

        let due = queue.get_due(config.batch_limit);
        for pulse in due {
            if !concurrency.try_acquire() {
                // At the in-flight cap; leave this pulse PENDING, it will
                // be re-observed next tick.
                continue;
            }

            match queue.mark_processing(pulse.id).await {
                Ok(true) => {
                    let queue = queue.clone();
                    let executor = executor.clone();
                    let concurrency = concurrency.clone();
                    let desk_path = config.desk_path.clone();
                    let timeout = config.executor_timeout;
                    in_flight.spawn(async move {
                        execute_pulse(pulse, queue, executor, desk_path, timeout).await;
                        concurrency.release();
                    });
                }
                Ok(false) => {
                    // Lost the claim race to another caller; give the slot back.
                    concurrency.release();
                }
                Err(e) => {
                    concurrency.release();
                    error!(pulse_id = pulse.id, error = %e, "failed to claim pulse");
                }
            }
        }
    }

    info!(in_flight = in_flight.len(), "scheduling loop stopped, awaiting in-flight pulses");
    let grace = config.shutdown_grace;
    let drained = tokio::time::timeout(grace, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = in_flight.len(),
            "grace period elapsed, abandoning remaining in-flight pulses"
        );
    }
    // Dropping `in_flight` here aborts anything still running.
}

async fn execute_pulse(
    pulse: Pulse,
    queue: Arc<Queue>,
    executor: Arc<Executor>,
    desk_path: PathBuf,
    timeout: Duration,
) {
    let start = std::time::Instant::now();
    info!(
        pulse_id = pulse.id,
        priority = ?pulse.priority,
        prompt = %pulse.prompt_excerpt(),
        "executing pulse"
    );

    let req = ExecuteRequest {
        prompt: pulse.prompt.clone(),
        session_id: pulse.session_id.clone(),
        sticky_notes: pulse.sticky_notes.clone(),
        working_dir: desk_path,
        timeout,
    };

    match executor.execute(req).await {
        Ok(result) => {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            if result.is_error || result.timed_out {
                let message = result
                    .error_message
                    .unwrap_or_else(|| "runner reported an error with no message".to_string());
                match queue.mark_failed(pulse.id, message, true).await {
                    Ok(Some(retry_id)) => {
                        info!(pulse_id = pulse.id, retry_id, "pulse failed, retry scheduled")
                    }
                    Ok(None) => info!(pulse_id = pulse.id, "pulse failed, no retry scheduled"),
                    Err(e) => error!(pulse_id = pulse.id, error = %e, "failed to record failure"),
                }
            } else if let Err(e) = queue.mark_completed(pulse.id, elapsed_ms).await {
                error!(pulse_id = pulse.id, error = %e, "failed to record completion");
            }
        }
        // Spawn-class errors (missing runner, missing working dir) are not
        // retried: retrying them would burn through max_retries against a
        // broken install rather than a transient runtime failure.
        Err(ExecutorError::MissingWorkingDir(path)) => {
            let message = format!("working directory does not exist: {path:?}");
            warn!(pulse_id = pulse.id, %message, "pulse failed, not retrying");
            let _ = queue.mark_failed(pulse.id, message, false).await;
        }
        Err(ExecutorError::Spawn { command, source }) => {
            let message = format!("failed to spawn runner {command:?}: {source}");
            warn!(pulse_id = pulse.id, %message, "pulse failed, not retrying");
            let _ = queue.mark_failed(pulse.id, message, false).await;
        }
    }
}
