use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

use crate::stream::StreamParser;

/// Spawn-time failure: the runner executable or working directory is
/// missing. Distinct from a runtime failure reported by the runner itself —
/// the daemon treats this kind as non-retryable rather than burning through
/// `max_retries` against a broken install.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("working directory does not exist: {0}")]
    MissingWorkingDir(PathBuf),

    #[error("failed to spawn runner {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct ExecuteRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    pub sticky_notes: Option<Vec<String>>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

/// What came back from one runner invocation. Always produced on a
/// successful spawn, even when the run itself failed, timed out, or the
/// runner exited non-zero — those are represented as fields, not as `Err`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub timed_out: bool,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub tool_call_count: usize,
}

pub struct Executor {
    runner_command: String,
}

impl Executor {
    pub fn new(runner_command: impl Into<String>) -> Self {
        Self {
            runner_command: runner_command.into(),
        }
    }

    /// Prepends nothing, appends a sticky-notes section when `notes` is
    /// non-empty — the only prompt transformation this component performs.
    pub fn assemble_prompt(base: &str, notes: Option<&[String]>) -> String {
        match notes {
            Some(notes) if !notes.is_empty() => {
                let mut out = base.to_string();
                out.push_str("\n\n📌 Reminders:");
                for n in notes {
                    out.push_str(&format!("\n  - {n}"));
                }
                out
            }
            _ => base.to_string(),
        }
    }

    pub async fn execute(&self, req: ExecuteRequest) -> Result<ExecutionResult, ExecutorError> {
        if !req.working_dir.is_dir() {
            return Err(ExecutorError::MissingWorkingDir(req.working_dir));
        }

        let prompt = Self::assemble_prompt(&req.prompt, req.sticky_notes.as_deref());

        let mut cmd = Command::new(&self.runner_command);
        cmd.arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if let Some(session_id) = &req.session_id {
            cmd.arg("--resume").arg(session_id);
        }
        cmd.arg(&prompt);
        cmd.current_dir(&req.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            command: self.runner_command.clone(),
            source,
        })?;
        let child_pid = child.id();

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(read_all_lossy(stdout));
        let stderr_task = tokio::spawn(read_all_lossy(stderr));

        let timed_out = tokio::time::timeout(req.timeout, child.wait()).await.is_err();
        if timed_out {
            kill_process_group(child_pid);
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill timed-out runner child");
            }
            let _ = child.wait().await;
        }

        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();

        let mut parser = StreamParser::new();
        for line in stdout_text.lines() {
            parser.feed_line(line);
        }
        let aggregate = parser.finish();

        if timed_out {
            return Ok(ExecutionResult {
                stdout: stdout_text,
                stderr: stderr_text,
                return_code: -1,
                timed_out: true,
                session_id: aggregate.session_id,
                is_error: true,
                error_message: Some(format!(
                    "execution timed out after {:?}",
                    req.timeout
                )),
                tool_call_count: aggregate.tool_uses.len(),
            });
        }

        // We already awaited `child.wait()` once inside the timeout future;
        // call it again to retrieve the exit status (cheap: the child has
        // already exited, this just reaps it).
        let status = child.wait().await.map_err(|source| ExecutorError::Spawn {
            command: self.runner_command.clone(),
            source,
        })?;
        let return_code = status.code().unwrap_or(-1);
        let runtime_failed = !status.success();

        Ok(ExecutionResult {
            stdout: stdout_text,
            stderr: stderr_text.clone(),
            return_code,
            timed_out: false,
            session_id: aggregate.session_id,
            is_error: runtime_failed || aggregate.is_error,
            error_message: if runtime_failed {
                Some(format!(
                    "runner exited with code {return_code}: {}",
                    tail_chars(&stderr_text, 2000)
                ))
            } else {
                aggregate.error_message
            },
            tool_call_count: aggregate.tool_uses.len(),
        })
    }
}

/// `process_group(0)` at spawn made the child its own group leader, so its
/// pid doubles as the group id. A negative pid in a `kill()` call targets
/// every process in that group, reaching grandchildren the runner spawned
/// that `start_kill()` alone would leave behind.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let pgid = pid as libc::pid_t;
    // SAFETY: `kill` with a negative pid signals the process group rather
    // than a single process; no pointers are involved.
    let ret = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(error = %err, pgid, "failed to kill timed-out runner process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

async fn read_all_lossy(mut reader: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        warn!(error = %e, "failed to fully read runner output stream");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn tail_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_prompt_appends_sticky_notes_exactly() {
        let notes = vec!["buy milk".to_string(), "call mom".to_string()];
        let out = Executor::assemble_prompt("check in", Some(&notes));
        assert_eq!(out, "check in\n\n📌 Reminders:\n  - buy milk\n  - call mom");
    }

    #[test]
    fn assemble_prompt_passes_through_when_no_notes() {
        assert_eq!(Executor::assemble_prompt("check in", None), "check in");
        assert_eq!(Executor::assemble_prompt("check in", Some(&[])), "check in");
    }

    #[tokio::test]
    async fn execute_fails_distinctly_on_missing_working_dir() {
        let executor = Executor::new("true");
        let result = executor
            .execute(ExecuteRequest {
                prompt: "hi".to_string(),
                session_id: None,
                sticky_notes: None,
                working_dir: PathBuf::from("/nonexistent/pulse-test-dir"),
                timeout: Duration::from_secs(5),
            })
            .await;
        assert!(matches!(result, Err(ExecutorError::MissingWorkingDir(_))));
    }

    #[tokio::test]
    async fn execute_fails_distinctly_on_missing_executable() {
        let dir = tempfile_dir();
        let executor = Executor::new("/nonexistent/pulse-test-runner-binary");
        let result = executor
            .execute(ExecuteRequest {
                prompt: "hi".to_string(),
                session_id: None,
                sticky_notes: None,
                working_dir: dir,
                timeout: Duration::from_secs(5),
            })
            .await;
        assert!(matches!(result, Err(ExecutorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn execute_captures_stdout_and_parses_stream_json() {
        let dir = tempfile_dir();
        // `/bin/echo` is the simplest real executable to exercise the
        // spawn+capture path without depending on the real runner binary.
        let executor = Executor::new("/bin/echo");
        let result = executor
            .execute(ExecuteRequest {
                prompt: r#"{"type":"system","subtype":"init","session_id":"s1"}"#.to_string(),
                session_id: None,
                sticky_notes: None,
                working_dir: dir,
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();
        assert_eq!(result.return_code, 0);
        assert!(!result.timed_out);
    }

    fn tempfile_dir() -> PathBuf {
        std::env::temp_dir()
    }
}
