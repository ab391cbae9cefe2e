//! Asynchronous job polling
//!
//! Long-running generations answer with a task reference. The poller queries
//! the status endpoint on a fixed interval until the job reaches a terminal
//! state or the attempt budget runs out. A failed status query counts as an
//! attempt but does not abort the loop.

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Session;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 90;

/// Terminal result of polling one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        /// First match of the result-extraction order, if any
        content: Option<String>,
        /// Last status document
        data: Value,
    },
    Failed {
        message: String,
        data: Value,
    },
    TimedOut {
        attempts: u32,
    },
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskPoller {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for TaskPoller {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl TaskPoller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Drive `task_id` to a terminal state.
    ///
    /// Waits between attempts are plain timer sleeps, so only the calling task
    /// is suspended.
    pub async fn poll(
        &self,
        session: &dyn Session,
        token: &str,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        for attempt in 1..=self.max_attempts {
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TaskOutcome::Cancelled,
                status = session.task_status(token, task_id) => status,
            };

            match status {
                Ok(data) => {
                    let state = task_state(&data);
                    metrics::counter!("proxy_task_polls_total", "outcome" => state.label())
                        .increment(1);
                    debug!(task_id, attempt, max = self.max_attempts, status = %status_text(&data), "task status");
                    match state {
                        TaskState::Completed => {
                            info!(task_id, attempt, "task completed");
                            let content = extract_task_content(&data);
                            return TaskOutcome::Completed { content, data };
                        }
                        TaskState::Failed => {
                            let message = data
                                .get("error")
                                .or_else(|| data.get("message"))
                                .map(value_text)
                                .unwrap_or_else(|| "Task failed".to_string());
                            warn!(task_id, attempt, %message, "task failed");
                            return TaskOutcome::Failed { message, data };
                        }
                        TaskState::Pending => {}
                    }
                }
                Err(e) => {
                    metrics::counter!("proxy_task_polls_total", "outcome" => "error").increment(1);
                    warn!(task_id, attempt, max = self.max_attempts, error = %e, "task status query failed");
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TaskOutcome::Cancelled,
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        warn!(task_id, attempts = self.max_attempts, "task polling limit reached");
        TaskOutcome::TimedOut {
            attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Completed,
    Failed,
}

impl TaskState {
    fn label(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

fn status_text(data: &Value) -> &str {
    ["task_status", "status"]
        .iter()
        .filter_map(|key| data.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or("unknown")
}

fn task_state(data: &Value) -> TaskState {
    match status_text(data) {
        "completed" | "success" => TaskState::Completed,
        "failed" | "error" => TaskState::Failed,
        _ => TaskState::Pending,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Result of a completed task: `content`, then `result` as a string, then
/// `result.url`, then `result.video_url`. First match wins.
pub fn extract_task_content(data: &Value) -> Option<String> {
    if let Some(content) = non_empty_str(data.get("content")) {
        return Some(content);
    }
    let result = data.get("result")?;
    if let Some(text) = non_empty_str(Some(result)) {
        return Some(text);
    }
    non_empty_str(result.get("url")).or_else(|| non_empty_str(result.get("video_url")))
}

/// Task identifier from a non-streaming execution body.
///
/// Checked in order: `data.messages[0].extra.wanx.task_id`, `id`, `task_id`,
/// `response_id`, `data.message_id`. Lookups also apply under a top-level
/// `data` envelope.
pub fn extract_task_id(body: &Value) -> Option<String> {
    let data = body.get("data");
    let candidates = [
        data.and_then(|d| d.pointer("/messages/0/extra/wanx/task_id")),
        body.pointer("/messages/0/extra/wanx/task_id"),
        body.get("id"),
        data.and_then(|d| d.get("id")),
        body.get("task_id"),
        data.and_then(|d| d.get("task_id")),
        body.get("response_id"),
        data.and_then(|d| d.get("response_id")),
        data.and_then(|d| d.get("message_id")),
    ];
    candidates.into_iter().find_map(non_empty_str)
}
