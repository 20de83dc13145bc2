//! Cron scheduling: one trigger loop per enabled task, computing the next
//! fire instant in the task's own timezone and handing matured occurrences
//! to the runner as detached executions.
//!
//! Expressions use the classic five fields (minute hour day month weekday).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::model::{Task, Trigger};
use crate::runner::TaskRunner;
use crate::settings::Settings;
use crate::store::Store;

/// Parse a five-field cron expression. The underlying schedule type wants a
/// seconds field, so a literal zero is prepended after the field count check.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    if fields != 5 {
        bail!("cron expression '{trimmed}' must have 5 fields, got {fields}");
    }
    Schedule::from_str(&format!("0 {trimmed}"))
        .with_context(|| format!("invalid cron expression '{trimmed}'"))
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| anyhow::anyhow!("invalid timezone '{name}': {e}"))
}

/// Validate the pair of scheduling fields a task carries; the CRUD boundary
/// calls this so a broken expression never reaches a trigger loop.
pub fn validate_schedule(cron_expr: &str, timezone: &str) -> Result<()> {
    parse_cron(cron_expr)?;
    parse_timezone(timezone)?;
    Ok(())
}

/// The first fire instant strictly after `after`, evaluated in `tz` and
/// mapped back to UTC. `None` for schedules with no future occurrence.
pub fn next_fire_after(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct SchedulerService {
    store: Store,
    runner: Arc<TaskRunner>,
    settings: Arc<Settings>,
    triggers: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl SchedulerService {
    pub fn new(store: Store, runner: Arc<TaskRunner>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            store,
            runner,
            settings,
            triggers: Mutex::new(HashMap::new()),
        })
    }

    /// Load every enabled task and start its trigger loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.reload_all().await
    }

    /// Reconcile trigger loops against the store: start loops for enabled
    /// tasks, stop loops whose task vanished or was disabled. Idempotent.
    pub async fn reload_all(self: &Arc<Self>) -> Result<()> {
        let tasks = self.store.list_enabled_tasks().await?;

        {
            let keep: std::collections::HashSet<i64> = tasks.iter().map(|t| t.id).collect();
            let mut triggers = self.triggers.lock().await;
            triggers.retain(|task_id, handle| {
                if keep.contains(task_id) {
                    true
                } else {
                    handle.abort();
                    false
                }
            });
        }

        let mut scheduled = 0usize;
        for task in &tasks {
            match self.add_task(task).await {
                Ok(()) => scheduled += 1,
                Err(e) => {
                    error!(task = %task.name, task_id = task.id, error = %e, "not scheduling task");
                }
            }
        }
        info!(scheduled, "scheduler reloaded");
        Ok(())
    }

    /// Start (or restart) the trigger loop for one task. Fails without side
    /// effects when the schedule fields do not parse.
    pub async fn add_task(self: &Arc<Self>, task: &Task) -> Result<()> {
        let schedule = parse_cron(&task.schedule_cron)?;
        let tz = parse_timezone(&task.timezone)?;
        if !task.enabled {
            self.remove_task(task.id).await;
            return Ok(());
        }

        let handle = {
            let scheduler = Arc::clone(self);
            let task_id = task.id;
            let task_name = task.name.clone();
            tokio::spawn(async move {
                scheduler.trigger_loop(task_id, task_name, schedule, tz).await;
            })
        };

        let mut triggers = self.triggers.lock().await;
        if let Some(old) = triggers.insert(task.id, handle) {
            old.abort();
        }
        Ok(())
    }

    /// Re-read a task from the store and bring its trigger loop in line.
    pub async fn update_task(self: &Arc<Self>, task_id: i64) -> Result<()> {
        match self.store.get_task(task_id).await? {
            Some(task) if task.enabled => self.add_task(&task).await,
            _ => {
                self.remove_task(task_id).await;
                Ok(())
            }
        }
    }

    pub async fn remove_task(&self, task_id: i64) {
        if let Some(handle) = self.triggers.lock().await.remove(&task_id) {
            handle.abort();
        }
    }

    /// Fire a task immediately, outside its schedule. The run executes
    /// detached; the returned id can be polled for the outcome.
    pub async fn run_now(&self, task_id: i64) -> Result<i64> {
        let run_id = self.store.create_run(task_id, Trigger::Manual, None).await?;
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            if let Err(e) = runner.execute_run(task_id, run_id, Trigger::Manual).await {
                error!(task_id, run_id, error = %e, "manual run aborted");
            }
        });
        Ok(run_id)
    }

    pub async fn scheduled_task_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.triggers.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn shutdown(&self) {
        let mut triggers = self.triggers.lock().await;
        for (_, handle) in triggers.drain() {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    async fn trigger_loop(self: Arc<Self>, task_id: i64, task_name: String, schedule: Schedule, tz: Tz) {
        let grace = self.settings.misfire_grace_seconds as i64;
        let mut cursor = Utc::now();
        loop {
            let Some(fire_at) = next_fire_after(&schedule, tz, cursor) else {
                warn!(task = %task_name, "schedule has no future occurrence, stopping trigger");
                return;
            };
            cursor = fire_at;

            let wait = fire_at - Utc::now();
            if wait > chrono::Duration::zero() {
                let wait = wait.to_std().unwrap_or(Duration::ZERO);
                debug!(task = %task_name, %fire_at, "next fire");
                tokio::time::sleep(wait).await;
            }

            let lateness = (Utc::now() - fire_at).num_seconds();
            if lateness > grace {
                warn!(task = %task_name, lateness, "missed fire beyond grace, skipping occurrence");
                let store = self.store.clone();
                tokio::spawn(async move {
                    match store.create_run(task_id, Trigger::Scheduler, Some(fire_at)).await {
                        Ok(run_id) => {
                            if let Err(e) = store
                                .mark_run_skipped(
                                    run_id,
                                    &format!("Missed scheduled time by {lateness}s"),
                                )
                                .await
                            {
                                error!(task_id, run_id, error = %e, "recording missed run");
                            }
                        }
                        Err(e) => error!(task_id, error = %e, "recording missed run"),
                    }
                });
                continue;
            }

            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                if let Err(e) = runner
                    .trigger_run(task_id, Trigger::Scheduler, Some(fire_at))
                    .await
                {
                    error!(task_id, error = %e, "scheduled run aborted");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_required() {
        assert!(parse_cron("0 9 * * *").is_ok());
        assert!(parse_cron("  */5 * * * *  ").is_ok());
        assert!(parse_cron("0 0 9 * * *").is_err());
        assert!(parse_cron("9 * *").is_err());
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[test]
    fn timezone_names_are_checked() {
        assert!(parse_timezone("Asia/Shanghai").is_ok());
        assert!(parse_timezone("UTC").is_ok());
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(validate_schedule("0 9 * * *", "Europe/Berlin").is_ok());
        assert!(validate_schedule("0 9 * * *", "nope").is_err());
    }

    #[test]
    fn next_fire_respects_the_task_timezone() {
        let schedule = parse_cron("0 9 * * *").expect("cron");
        let tz = parse_timezone("Asia/Shanghai").expect("tz");

        // 2024-01-01 00:30 UTC is 08:30 in Shanghai; the 09:00 local fire
        // is 01:00 UTC the same day.
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let fire = next_fire_after(&schedule, tz, after).expect("fire");
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());

        // Past 09:00 local, the next fire rolls to the following day.
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let fire = next_fire_after(&schedule, tz, after).expect("fire");
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap());
    }

    #[test]
    fn next_fire_is_strictly_after_the_cursor() {
        let schedule = parse_cron("0 9 * * *").expect("cron");
        let tz = parse_timezone("UTC").expect("tz");
        let exactly_nine = Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap();
        let fire = next_fire_after(&schedule, tz, exactly_nine).expect("fire");
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 3, 11, 9, 0, 0).unwrap());
    }
}
