//! SQLite persistence for accounts, tasks and run records.
//!
//! One shared connection guarded by a mutex; every operation runs inside its
//! own transaction on a blocking worker thread so the async executor never
//! stalls on disk I/O. Timestamps are stored as RFC 3339 TEXT.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde_json::Value;

use crate::model::{
    Account, AccountSnapshot, NewTask, RunStatus, Task, TaskResult, TaskRun, TaskSnapshot, Trigger,
    valid_session_name,
};

const ERROR_MESSAGE_MAX_CHARS: usize = 2000;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .with_context(|| format!("opening database at {}", path.display()))?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            init_schema(&conn)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        })
        .await?
    }

    /// In-memory database, used by tests and throwaway tooling.
    pub async fn open_in_memory() -> Result<Self> {
        tokio::task::spawn_blocking(|| {
            let conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            init_schema(&conn)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        })
        .await?
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("store connection poisoned"))?;
            f(&mut guard)
        })
        .await?
    }

    // ---- accounts ----

    pub async fn create_account(&self, name: &str, session_name: &str) -> Result<Account> {
        if !valid_session_name(session_name) {
            bail!(
                "invalid session name '{}': only [A-Za-z0-9_-] is allowed",
                session_name
            );
        }
        let name = name.to_string();
        let session_name = session_name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO accounts (name, session_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, session_name, ts(now), ts(now)],
            )
            .with_context(|| format!("creating account '{name}'"))?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(Account {
                id,
                name,
                session_name,
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    pub async fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, session_name, created_at, updated_at
                 FROM accounts WHERE id = ?1",
            )?;
            let mut rows = stmt.query(params![account_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(account_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn delete_account(&self, account_id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute("DELETE FROM accounts WHERE id = ?1", params![account_id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    // ---- tasks ----

    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            tx.execute(
                "INSERT INTO tasks
                   (name, task_type, enabled, account_id, target, schedule_cron, timezone,
                    jitter_seconds, max_runtime_seconds, retries, retry_backoff_seconds,
                    params, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    new.name,
                    new.task_type,
                    new.enabled as i64,
                    new.account_id,
                    new.target,
                    new.schedule_cron,
                    new.timezone,
                    new.jitter_seconds,
                    new.max_runtime_seconds,
                    new.retries,
                    new.retry_backoff_seconds,
                    new.params.to_string(),
                    ts(now),
                    ts(now),
                ],
            )
            .with_context(|| format!("creating task '{}'", new.name))?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(Task {
                id,
                name: new.name,
                task_type: new.task_type,
                enabled: new.enabled,
                account_id: new.account_id,
                target: new.target,
                schedule_cron: new.schedule_cron,
                timezone: new.timezone,
                jitter_seconds: new.jitter_seconds,
                max_runtime_seconds: new.max_runtime_seconds,
                retries: new.retries,
                retry_backoff_seconds: new.retry_backoff_seconds,
                params: new.params,
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE tasks SET
                   name = ?2, task_type = ?3, enabled = ?4, account_id = ?5, target = ?6,
                   schedule_cron = ?7, timezone = ?8, jitter_seconds = ?9,
                   max_runtime_seconds = ?10, retries = ?11, retry_backoff_seconds = ?12,
                   params = ?13, updated_at = ?14
                 WHERE id = ?1",
                params![
                    task.id,
                    task.name,
                    task.task_type,
                    task.enabled as i64,
                    task.account_id,
                    task.target,
                    task.schedule_cron,
                    task.timezone,
                    task.jitter_seconds,
                    task.max_runtime_seconds,
                    task.retries,
                    task.retry_backoff_seconds,
                    task.params.to_string(),
                    ts(Utc::now()),
                ],
            )?;
            tx.commit()?;
            if changed == 0 {
                bail!("task {} not found", task.id);
            }
            Ok(())
        })
        .await
    }

    pub async fn set_task_enabled(&self, task_id: i64, enabled: bool) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE tasks SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![task_id, enabled as i64, ts(Utc::now())],
            )?;
            tx.commit()?;
            if changed == 0 {
                bail!("task {task_id} not found");
            }
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("{TASK_SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query(params![task_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(task_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_enabled_tasks(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{TASK_SELECT} WHERE enabled = 1 ORDER BY id"))?;
            let mut rows = stmt.query([])?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(task_from_row(row)?);
            }
            Ok(tasks)
        })
        .await
    }

    pub async fn delete_task(&self, task_id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM task_runs WHERE task_id = ?1", params![task_id])?;
            let deleted = tx.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Immutable copies of the task and (when owned) its account, taken in a
    /// single transaction so the pair is mutually consistent.
    pub async fn load_snapshot(
        &self,
        task_id: i64,
    ) -> Result<Option<(TaskSnapshot, Option<AccountSnapshot>)>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let task = {
                let mut stmt = tx.prepare(&format!("{TASK_SELECT} WHERE id = ?1"))?;
                let mut rows = stmt.query(params![task_id])?;
                match rows.next()? {
                    Some(row) => task_from_row(row)?,
                    None => return Ok(None),
                }
            };
            let account = match task.account_id {
                Some(account_id) => {
                    let mut stmt = tx.prepare(
                        "SELECT id, name, session_name, created_at, updated_at
                         FROM accounts WHERE id = ?1",
                    )?;
                    let mut rows = stmt.query(params![account_id])?;
                    match rows.next()? {
                        Some(row) => Some(AccountSnapshot::of(&account_from_row(row)?)),
                        None => None,
                    }
                }
                None => None,
            };
            Ok(Some((TaskSnapshot::of(&task), account)))
        })
        .await
    }

    // ---- runs ----

    pub async fn create_run(
        &self,
        task_id: i64,
        triggered_by: Trigger,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO task_runs
                   (task_id, status, attempt, triggered_by, scheduled_for, result, created_at)
                 VALUES (?1, ?2, 0, ?3, ?4, '{}', ?5)",
                params![
                    task_id,
                    RunStatus::Queued.as_str(),
                    triggered_by.as_str(),
                    scheduled_for.map(ts),
                    ts(Utc::now()),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    pub async fn mark_run_running(&self, run_id: i64) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE task_runs SET status = ?2, started_at = ?3 WHERE id = ?1",
                params![run_id, RunStatus::Running.as_str(), ts(Utc::now())],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn set_run_attempt(&self, run_id: i64, attempt: i64) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE task_runs SET attempt = ?2 WHERE id = ?1",
                params![run_id, attempt],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn mark_run_success(
        &self,
        run_id: i64,
        result: &TaskResult,
        duration_ms: i64,
    ) -> Result<()> {
        let payload = serde_json::json!({ "task_result": result });
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE task_runs SET
                   status = ?2, finished_at = ?3, duration_ms = ?4,
                   error_message = NULL, result = ?5
                 WHERE id = ?1",
                params![
                    run_id,
                    RunStatus::Success.as_str(),
                    ts(Utc::now()),
                    duration_ms,
                    payload.to_string(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn mark_run_failed(
        &self,
        run_id: i64,
        error_message: &str,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        let message = truncate_chars(error_message, ERROR_MESSAGE_MAX_CHARS);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE task_runs SET
                   status = ?2, finished_at = ?3,
                   duration_ms = COALESCE(?4, duration_ms),
                   error_message = ?5
                 WHERE id = ?1",
                params![
                    run_id,
                    RunStatus::Failed.as_str(),
                    ts(Utc::now()),
                    duration_ms,
                    message,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn mark_run_skipped(&self, run_id: i64, message: &str) -> Result<()> {
        let message = truncate_chars(message, ERROR_MESSAGE_MAX_CHARS);
        let payload = serde_json::json!({ "skipped": true, "message": message });
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = ts(Utc::now());
            tx.execute(
                "UPDATE task_runs SET
                   status = ?2, started_at = COALESCE(started_at, ?3), finished_at = ?3,
                   error_message = ?4, result = ?5
                 WHERE id = ?1",
                params![
                    run_id,
                    RunStatus::Skipped.as_str(),
                    now,
                    message,
                    payload.to_string(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<TaskRun>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("{RUN_SELECT} WHERE id = ?1"))?;
            let mut rows = stmt.query(params![run_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(run_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_runs(&self, task_id: i64) -> Result<Vec<TaskRun>> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{RUN_SELECT} WHERE task_id = ?1 ORDER BY id"))?;
            let mut rows = stmt.query(params![task_id])?;
            let mut runs = Vec::new();
            while let Some(row) = rows.next()? {
                runs.push(run_from_row(row)?);
            }
            Ok(runs)
        })
        .await
    }
}

const TASK_SELECT: &str = "SELECT id, name, task_type, enabled, account_id, target, \
     schedule_cron, timezone, jitter_seconds, max_runtime_seconds, retries, \
     retry_backoff_seconds, params, created_at, updated_at FROM tasks";

const RUN_SELECT: &str = "SELECT id, task_id, status, attempt, triggered_by, scheduled_for, \
     started_at, finished_at, duration_ms, error_message, result, created_at FROM task_runs";

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            session_name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            task_type TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            account_id INTEGER REFERENCES accounts(id),
            target TEXT,
            schedule_cron TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            jitter_seconds INTEGER NOT NULL DEFAULT 0,
            max_runtime_seconds INTEGER NOT NULL DEFAULT 120,
            retries INTEGER NOT NULL DEFAULT 0,
            retry_backoff_seconds INTEGER NOT NULL DEFAULT 30,
            params TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_enabled ON tasks(enabled);
        CREATE TABLE IF NOT EXISTS task_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            attempt INTEGER NOT NULL DEFAULT 0,
            triggered_by TEXT NOT NULL DEFAULT 'scheduler',
            scheduled_for TEXT,
            started_at TEXT,
            finished_at TEXT,
            duration_ms INTEGER,
            error_message TEXT,
            result TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_id);
        CREATE INDEX IF NOT EXISTS idx_task_runs_status ON task_runs(status);",
    )?;
    Ok(())
}

fn ts(when: DateTime<Utc>) -> String {
    when.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(&r)).transpose()
}

fn parse_json(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Object(Default::default()))
}

fn account_from_row(row: &rusqlite::Row<'_>) -> Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        session_name: row.get(2)?,
        created_at: parse_ts(&row.get::<_, String>(3)?)?,
        updated_at: parse_ts(&row.get::<_, String>(4)?)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        task_type: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        account_id: row.get(4)?,
        target: row.get(5)?,
        schedule_cron: row.get(6)?,
        timezone: row.get(7)?,
        jitter_seconds: row.get(8)?,
        max_runtime_seconds: row.get(9)?,
        retries: row.get(10)?,
        retry_backoff_seconds: row.get(11)?,
        params: parse_json(&row.get::<_, String>(12)?),
        created_at: parse_ts(&row.get::<_, String>(13)?)?,
        updated_at: parse_ts(&row.get::<_, String>(14)?)?,
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> Result<TaskRun> {
    let status_raw: String = row.get(2)?;
    let trigger_raw: String = row.get(4)?;
    Ok(TaskRun {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: RunStatus::from_str(&status_raw)
            .ok_or_else(|| anyhow!("unknown run status '{status_raw}'"))?,
        attempt: row.get(3)?,
        triggered_by: Trigger::from_str(&trigger_raw)
            .ok_or_else(|| anyhow!("unknown trigger '{trigger_raw}'"))?,
        scheduled_for: parse_ts_opt(row.get(5)?)?,
        started_at: parse_ts_opt(row.get(6)?)?,
        finished_at: parse_ts_opt(row.get(7)?)?,
        duration_ms: row.get(8)?,
        error_message: row.get(9)?,
        result: parse_json(&row.get::<_, String>(10)?),
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
