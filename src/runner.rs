//! Run execution: takes a queued run record through the attempt loop and
//! leaves exactly one terminal status behind. Failures inside a handler are
//! captured into the run record; only infrastructure errors (the store
//! itself) propagate to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{RunStatus, TaskResult, Trigger};
use crate::router::RouterError;
use crate::settings::Settings;
use crate::store::Store;
use crate::tasks::{Collaborators, HandlerRegistry, TaskContext};

/// Serialization key for an execution. Tasks owned by an account share one
/// lock per account; account-less tasks get a lock of their own, in a
/// separate namespace so ids cannot collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Account(i64),
    Task(i64),
}

pub struct TaskRunner {
    store: Store,
    registry: Arc<HandlerRegistry>,
    settings: Arc<Settings>,
    collab: Collaborators,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl TaskRunner {
    pub fn new(
        store: Store,
        registry: Arc<HandlerRegistry>,
        settings: Arc<Settings>,
        collab: Collaborators,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            settings,
            collab,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Create a run record for `task_id` and drive it to a terminal state.
    /// Returns the run id; the record carries the outcome.
    pub async fn trigger_run(
        &self,
        task_id: i64,
        triggered_by: Trigger,
        scheduled_for: Option<chrono::DateTime<Utc>>,
    ) -> Result<i64> {
        let run_id = self
            .store
            .create_run(task_id, triggered_by, scheduled_for)
            .await?;
        self.execute_run(task_id, run_id, triggered_by).await?;
        Ok(run_id)
    }

    /// Drive an existing queued run to a terminal state.
    pub async fn execute_run(
        &self,
        task_id: i64,
        run_id: i64,
        triggered_by: Trigger,
    ) -> Result<RunStatus> {
        let Some((task, account)) = self.store.load_snapshot(task_id).await? else {
            self.store
                .mark_run_failed(run_id, "Task not found", None)
                .await?;
            return Ok(RunStatus::Failed);
        };

        if !task.enabled {
            self.store
                .mark_run_skipped(run_id, "Task is disabled")
                .await?;
            return Ok(RunStatus::Skipped);
        }

        let Some(handler) = self.registry.get(&task.task_type) else {
            self.store
                .mark_run_failed(
                    run_id,
                    &format!("No handler for task type '{}'", task.task_type),
                    None,
                )
                .await?;
            return Ok(RunStatus::Failed);
        };

        // Bad params never enter the attempt loop; retrying cannot fix them.
        if let Err(e) = handler.validate_params(&task.params) {
            self.store
                .mark_run_failed(run_id, &format!("Invalid params: {e:#}"), None)
                .await?;
            return Ok(RunStatus::Failed);
        }

        let lock_key = match account.as_ref() {
            Some(acct) => LockKey::Account(acct.id),
            None => LockKey::Task(task.id),
        };
        let lock = self.lock_for(lock_key).await;
        let _guard = lock.lock().await;

        // Jitter happens while the run is still queued; the running
        // transition and the duration clock only cover real attempt work.
        if triggered_by == Trigger::Scheduler && task.jitter_seconds > 0 {
            let jitter = rand::thread_rng().gen_range(0.0..=task.jitter_seconds as f64);
            tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
        }

        self.store.mark_run_running(run_id).await?;
        let started = tokio::time::Instant::now();

        let max_runtime = Duration::from_secs(task.max_runtime_seconds.max(1) as u64);
        let attempts = task.retries.max(0) + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.store.set_run_attempt(run_id, attempt).await?;
            let ctx = TaskContext {
                task: task.clone(),
                account: account.clone(),
                now: Utc::now(),
                settings: Arc::clone(&self.settings),
                collab: self.collab.clone(),
                triggered_by,
            };

            let outcome = tokio::time::timeout(max_runtime, handler.execute(&ctx, &task.params)).await;
            match outcome {
                Ok(Ok(result)) if result.success => {
                    let duration_ms = started.elapsed().as_millis() as i64;
                    info!(task = %task.name, run_id, attempt, "run succeeded");
                    self.store
                        .mark_run_success(run_id, &result, duration_ms)
                        .await?;
                    return Ok(RunStatus::Success);
                }
                Ok(Ok(TaskResult { message, .. })) => {
                    last_error = message;
                }
                Ok(Err(e)) => {
                    last_error = error_label(&e);
                }
                Err(_) => {
                    last_error = format!("Timed out after {}s", max_runtime.as_secs());
                }
            }
            warn!(task = %task.name, run_id, attempt, error = %last_error, "attempt failed");

            if attempt < attempts {
                let delay = backoff_delay(
                    task.retry_backoff_seconds.max(0) as f64,
                    attempt,
                    task.jitter_seconds.max(0) as f64,
                );
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        self.store
            .mark_run_failed(run_id, &last_error, Some(duration_ms))
            .await?;
        Ok(RunStatus::Failed)
    }

    async fn lock_for(&self, key: LockKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key).or_default())
    }
}

/// Deterministic part of the retry backoff: exponential doubling on the
/// configured base.
fn backoff_base(base: f64, attempt: i64) -> f64 {
    base * 2f64.powi((attempt - 1).max(0) as i32)
}

/// Full backoff for the wait after `attempt` failed: exponential base plus
/// bounded random noise, plus the task's jitter bound when one is set, so
/// fleets sharing a backoff base drift apart on retry.
fn backoff_delay(base: f64, attempt: i64, jitter: f64) -> f64 {
    let delay = backoff_base(base, attempt);
    let noise_bound = (delay * 0.1 + 1.0).min(1.0);
    let mut total = delay + rand::thread_rng().gen_range(0.0..=noise_bound);
    if jitter > 0.0 {
        total += rand::thread_rng().gen_range(0.0..=jitter);
    }
    total
}

/// Collapse a handler error chain into the stored label. Router timeouts get
/// their own prefix; everything else is an opaque handler error.
fn error_label(error: &anyhow::Error) -> String {
    if let Some(timeout) = error.downcast_ref::<RouterError>() {
        return format!("Timeout: {timeout}");
    }
    format!("HandlerError: {error:#}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_base(30.0, 1), 30.0);
        assert_eq!(backoff_base(30.0, 2), 60.0);
        assert_eq!(backoff_base(30.0, 3), 120.0);
        assert_eq!(backoff_base(0.0, 5), 0.0);
    }

    #[test]
    fn backoff_noise_and_jitter_stay_bounded() {
        for attempt in 1..=4 {
            let base = backoff_base(10.0, attempt);
            for _ in 0..50 {
                let d = backoff_delay(10.0, attempt, 0.0);
                assert!(d >= base);
                assert!(d <= base + 1.0);

                let j = backoff_delay(10.0, attempt, 5.0);
                assert!(j >= base);
                assert!(j <= base + 1.0 + 5.0);
            }
        }
    }

    #[test]
    fn error_labels_distinguish_router_timeouts() {
        let timeout: anyhow::Error = RouterError::Timeout { peer_id: 2 }.into();
        assert!(error_label(&timeout).starts_with("Timeout:"));

        let other = anyhow!("boom").context("sending failed");
        let label = error_label(&other);
        assert!(label.starts_with("HandlerError:"));
        assert!(label.contains("boom"));
    }
}
