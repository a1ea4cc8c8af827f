//! Remote asynchronous tasks: creation handle, poll policy and the poll loop.
//!
//! Transcription and synthesis both submit work to a task API and poll it
//! until it reports `completed` or `failed`. The loop checks the cancel flag
//! on every iteration so a stopped conversation never keeps polling.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// How the delay between polls grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: f64, max: Duration },
}

/// Poll budget: `max_attempts` polls, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay before poll number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { factor, max } => {
                let scaled = self.interval.as_secs_f64() * factor.powi(attempt as i32);
                Duration::from_secs_f64(scaled).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

/// One poll response from the task API.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskPoll<T> {
    pub status: TaskStatus,
    #[serde(default = "Option::default")]
    pub output: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A submitted remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingTask {
    pub id: String,
    pub label: &'static str,
}

impl StreamingTask {
    pub fn new(id: impl Into<String>, label: &'static str) -> Self {
        Self { id: id.into(), label }
    }
}

/// Cooperative cancellation shared between the orchestrator and in-flight work.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    pub fn check(&self, what: &str) -> VoiceResult<()> {
        if self.is_cancelled() {
            Err(VoiceError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Poll `task` until it completes, fails, is cancelled or the budget runs out.
pub async fn await_task<T, F, Fut>(
    task: &StreamingTask,
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    mut poll: F,
) -> VoiceResult<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = VoiceResult<TaskPoll<T>>>,
{
    for attempt in 0..policy.max_attempts {
        cancel.check(task.label)?;
        tokio::select! {
            _ = tokio::time::sleep(policy.delay_for(attempt)) => {}
            _ = cancel.cancelled() => {
                return Err(VoiceError::Cancelled(task.label.to_string()));
            }
        }
        cancel.check(task.label)?;

        let result = poll(task.id.clone()).await?;
        debug!("{} task {} poll #{}: {:?}", task.label, task.id, attempt + 1, result.status);
        match result.status {
            TaskStatus::Completed => {
                return result.output.ok_or_else(|| {
                    VoiceError::Protocol(format!("{} task {} completed without output", task.label, task.id))
                });
            }
            TaskStatus::Failed => {
                return Err(VoiceError::Protocol(format!(
                    "{} task {} failed: {}",
                    task.label,
                    task.id,
                    result.error.unwrap_or_else(|| "unknown error".to_string())
                )));
            }
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Processing => {}
        }
    }

    Err(VoiceError::Timeout(format!(
        "{} task {} did not finish after {} polls",
        task.label, task.id, policy.max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            interval: Duration::from_millis(1),
            backoff: Backoff::Fixed,
        }
    }

    fn poll_result(status: TaskStatus, output: Option<&str>) -> TaskPoll<String> {
        TaskPoll {
            status,
            output: output.map(str::to_string),
            error: None,
        }
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_millis(100),
            backoff: Backoff::Exponential {
                factor: 2.0,
                max: Duration::from_millis(500),
            },
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn completes_after_processing_polls() {
        let polls = Arc::new(AtomicU32::new(0));
        let counter = polls.clone();
        let task = StreamingTask::new("t-1", "transcription");
        let text = await_task(&task, &fast(5), &CancelFlag::new(), move |id| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                assert_eq!(id, "t-1");
                Ok(if n < 2 {
                    poll_result(TaskStatus::Processing, None)
                } else {
                    poll_result(TaskStatus::Completed, Some("你好"))
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(text, "你好");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_is_a_timeout() {
        let task = StreamingTask::new("t-2", "synthesis");
        let err = await_task(&task, &fast(3), &CancelFlag::new(), |_| async {
            Ok(poll_result(TaskStatus::Pending, None))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, VoiceError::Timeout(_)));
    }

    #[tokio::test]
    async fn failed_task_reports_remote_error() {
        let task = StreamingTask::new("t-3", "synthesis");
        let err = await_task(&task, &fast(3), &CancelFlag::new(), |_| async {
            Ok(TaskPoll::<String> {
                status: TaskStatus::Failed,
                output: None,
                error: Some("quota".to_string()),
            })
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let task = StreamingTask::new("t-4", "transcription");
        let err = await_task(&task, &fast(30), &cancel, |_| async {
            Ok(poll_result(TaskStatus::Completed, Some("late")))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, VoiceError::Cancelled(_)));
    }
}
