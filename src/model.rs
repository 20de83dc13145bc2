use chrono::{DateTime, Utc};
use serde_json::Value;

/// Who asked for a run: a matured cron trigger or an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduler,
    Manual,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Scheduler => "scheduler",
            Trigger::Manual => "manual",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduler" => Some(Trigger::Scheduler),
            "manual" => Some(Trigger::Manual),
            _ => None,
        }
    }
}

/// Lifecycle of a single recorded run. A run is created in `Queued`, moves to
/// `Running` when the first attempt starts, and ends in exactly one of the
/// three terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Skipped
        )
    }
}

/// A persisted chat account. `session_name` keys the external chat client,
/// the per-account execution lock and the router's queue namespace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub session_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted, mutable task definition.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub task_type: String,
    pub enabled: bool,
    pub account_id: Option<i64>,
    pub target: Option<String>,
    pub schedule_cron: String,
    pub timezone: String,
    pub jitter_seconds: i64,
    pub max_runtime_seconds: i64,
    pub retries: i64,
    pub retry_backoff_seconds: i64,
    pub params: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a task; ids and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub task_type: String,
    pub enabled: bool,
    pub account_id: Option<i64>,
    pub target: Option<String>,
    pub schedule_cron: String,
    pub timezone: String,
    pub jitter_seconds: i64,
    pub max_runtime_seconds: i64,
    pub retries: i64,
    pub retry_backoff_seconds: i64,
    pub params: Value,
}

impl NewTask {
    pub fn new(name: &str, task_type: &str, schedule_cron: &str) -> Self {
        Self {
            name: name.to_string(),
            task_type: task_type.to_string(),
            enabled: true,
            account_id: None,
            target: None,
            schedule_cron: schedule_cron.to_string(),
            timezone: "UTC".to_string(),
            jitter_seconds: 0,
            max_runtime_seconds: 120,
            retries: 0,
            retry_backoff_seconds: 30,
            params: Value::Object(Default::default()),
        }
    }
}

/// One recorded execution attempt-sequence of a task.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    pub status: RunStatus,
    pub attempt: i64,
    pub triggered_by: Trigger,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

/// Immutable copy of a task taken at run start. Handlers only ever see
/// snapshots, so concurrent edits to the live row cannot affect an
/// in-flight execution.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: i64,
    pub name: String,
    pub task_type: String,
    pub enabled: bool,
    pub account_id: Option<i64>,
    pub target: Option<String>,
    pub schedule_cron: String,
    pub timezone: String,
    pub jitter_seconds: i64,
    pub max_runtime_seconds: i64,
    pub retries: i64,
    pub retry_backoff_seconds: i64,
    pub params: Value,
}

impl TaskSnapshot {
    pub fn of(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            task_type: task.task_type.clone(),
            enabled: task.enabled,
            account_id: task.account_id,
            target: task.target.clone(),
            schedule_cron: task.schedule_cron.clone(),
            timezone: task.timezone.clone(),
            jitter_seconds: task.jitter_seconds,
            max_runtime_seconds: task.max_runtime_seconds,
            retries: task.retries,
            retry_backoff_seconds: task.retry_backoff_seconds,
            params: task.params.clone(),
        }
    }
}

/// Immutable copy of an account taken at run start.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub id: i64,
    pub name: String,
    pub session_name: String,
}

impl AccountSnapshot {
    pub fn of(account: &Account) -> Self {
        Self {
            id: account.id,
            name: account.name.clone(),
            session_name: account.session_name.clone(),
        }
    }
}

/// What a handler hands back to the runner. Never persisted on its own; the
/// runner folds it into the terminal `TaskRun` fields.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl TaskResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn fail_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
        }
    }
}

/// Session names key the chat client's on-disk session files and the lock
/// table, so they are restricted to a filesystem- and log-safe charset.
pub fn valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_strings() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Skipped,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::from_str("bogus"), None);
    }

    #[test]
    fn terminal_states_are_exactly_the_three_outcomes() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Skipped.is_terminal());
    }

    #[test]
    fn session_name_charset_is_enforced() {
        assert!(valid_session_name("alice_01"));
        assert!(valid_session_name("bot-7"));
        assert!(!valid_session_name(""));
        assert!(!valid_session_name("has space"));
        assert!(!valid_session_name("sneaky/../path"));
    }
}
