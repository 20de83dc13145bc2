mod common;

use std::sync::Arc;

use common::{ScriptHandler, Scripted, env_with, wait_terminal};
use rollcall::model::{NewTask, RunStatus, Trigger};
use rollcall::scheduler::SchedulerService;
use rollcall::settings::Settings;
use rollcall::tasks::HandlerRegistry;

fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(ScriptHandler::new(vec![Scripted::Succeed("ok")]))
        .expect("register");
    registry
}

#[tokio::test]
async fn reload_schedules_only_enabled_tasks_with_valid_schedules() {
    let env = env_with(registry(), "").await;
    let scheduler = SchedulerService::new(
        env.store.clone(),
        Arc::clone(&env.runner),
        Arc::new(Settings::default()),
    );

    let good = env
        .store
        .create_task(NewTask::new("good", "script", "0 9 * * *"))
        .await
        .expect("good");
    let mut disabled = NewTask::new("disabled", "script", "0 9 * * *");
    disabled.enabled = false;
    env.store.create_task(disabled).await.expect("disabled");
    env.store
        .create_task(NewTask::new("bad-cron", "script", "whenever"))
        .await
        .expect("bad cron");
    let mut bad_tz = NewTask::new("bad-tz", "script", "0 9 * * *");
    bad_tz.timezone = "Mars/Olympus".into();
    env.store.create_task(bad_tz).await.expect("bad tz");

    scheduler.start().await.expect("start");
    assert_eq!(scheduler.scheduled_task_ids().await, vec![good.id]);

    // Reconciling again changes nothing.
    scheduler.reload_all().await.expect("reload");
    assert_eq!(scheduler.scheduled_task_ids().await, vec![good.id]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn update_task_follows_the_enabled_flag() {
    let env = env_with(registry(), "").await;
    let scheduler = SchedulerService::new(
        env.store.clone(),
        Arc::clone(&env.runner),
        Arc::new(Settings::default()),
    );
    let task = env
        .store
        .create_task(NewTask::new("flip", "script", "0 9 * * *"))
        .await
        .expect("task");

    scheduler.update_task(task.id).await.expect("schedule");
    assert_eq!(scheduler.scheduled_task_ids().await, vec![task.id]);

    env.store
        .set_task_enabled(task.id, false)
        .await
        .expect("disable");
    scheduler.update_task(task.id).await.expect("unschedule");
    assert!(scheduler.scheduled_task_ids().await.is_empty());

    env.store
        .set_task_enabled(task.id, true)
        .await
        .expect("enable");
    scheduler.update_task(task.id).await.expect("reschedule");
    assert_eq!(scheduler.scheduled_task_ids().await, vec![task.id]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn removed_and_deleted_tasks_lose_their_triggers() {
    let env = env_with(registry(), "").await;
    let scheduler = SchedulerService::new(
        env.store.clone(),
        Arc::clone(&env.runner),
        Arc::new(Settings::default()),
    );
    let keep = env
        .store
        .create_task(NewTask::new("keep", "script", "0 9 * * *"))
        .await
        .expect("keep");
    let drop = env
        .store
        .create_task(NewTask::new("drop", "script", "0 9 * * *"))
        .await
        .expect("drop");

    scheduler.start().await.expect("start");
    assert_eq!(
        scheduler.scheduled_task_ids().await,
        vec![keep.id, drop.id]
    );

    env.store.delete_task(drop.id).await.expect("delete drop");
    scheduler.remove_task(drop.id).await;
    assert_eq!(scheduler.scheduled_task_ids().await, vec![keep.id]);

    // A deleted task disappears on the next reconcile.
    env.store.delete_task(keep.id).await.expect("delete");
    scheduler.reload_all().await.expect("reload");
    assert!(scheduler.scheduled_task_ids().await.is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn run_now_executes_detached_with_a_manual_trigger() {
    let env = env_with(registry(), "").await;
    let scheduler = SchedulerService::new(
        env.store.clone(),
        Arc::clone(&env.runner),
        Arc::new(Settings::default()),
    );
    let task = env
        .store
        .create_task(NewTask::new("fire", "script", "0 9 * * *"))
        .await
        .expect("task");

    let run_id = scheduler.run_now(task.id).await.expect("run now");
    let run = wait_terminal(&env.store, run_id).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.triggered_by, Trigger::Manual);
    assert!(run.scheduled_for.is_none());
}

#[tokio::test]
async fn run_now_on_a_missing_task_records_the_failure() {
    let env = env_with(registry(), "").await;
    let scheduler = SchedulerService::new(
        env.store.clone(),
        Arc::clone(&env.runner),
        Arc::new(Settings::default()),
    );

    let run_id = scheduler.run_now(98765).await.expect("run now");
    let run = wait_terminal(&env.store, run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("Task not found"));
}
