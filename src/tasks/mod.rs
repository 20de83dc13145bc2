//! Task handler abstraction: the polymorphic `execute` contract, the
//! per-run context handed to handlers, and the explicit registry that maps
//! task-type names to implementations.

mod bot_checkin;
mod button_checkin;
mod chat_monitor;
mod media_keepalive;
pub mod patterns;
mod send_message;

pub use bot_checkin::{BotCheckin, BotCheckinConfig};
pub use button_checkin::{ButtonCheckin, ButtonCheckinConfig};
pub use chat_monitor::{ChatMonitor, ChatMonitorConfig};
pub use media_keepalive::{MediaKeepalive, MediaKeepaliveConfig};
pub use send_message::{SendMessage, SendMessageConfig};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::chat::ChatClientManager;
use crate::model::{AccountSnapshot, TaskResult, TaskSnapshot, Trigger};
use crate::router::ConversationRouter;
use crate::settings::Settings;
use crate::solver::ChallengeSolver;

/// External collaborators injected into every handler invocation.
#[derive(Clone)]
pub struct Collaborators {
    pub chat: Arc<dyn ChatClientManager>,
    pub router: Arc<ConversationRouter>,
    pub solver: Arc<dyn ChallengeSolver>,
}

/// Everything a handler may look at during one execution. Snapshots only;
/// a handler never sees live, mutable records.
pub struct TaskContext {
    pub task: TaskSnapshot,
    pub account: Option<AccountSnapshot>,
    pub now: DateTime<Utc>,
    pub settings: Arc<Settings>,
    pub collab: Collaborators,
    pub triggered_by: Trigger,
}

impl TaskContext {
    pub fn account(&self) -> Result<&AccountSnapshot> {
        self.account
            .as_ref()
            .ok_or_else(|| anyhow!("task '{}' has no account configured", self.task.name))
    }

    pub fn target(&self) -> Result<&str> {
        self.task
            .target
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("task '{}' has no target configured", self.task.name))
    }

    /// Handlers skip human-like delays when an operator fires the task by hand.
    pub fn is_manual(&self) -> bool {
        self.triggered_by == Trigger::Manual
    }
}

/// One task type's implementation. Handlers are stateless between
/// invocations; all per-run state lives inside `execute`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &'static str;

    /// Check raw task params against this handler's config schema. Called at
    /// the CRUD boundary when a task is created or updated, and again by the
    /// runner before the attempt loop.
    fn validate_params(&self, params: &Value) -> Result<()>;

    async fn execute(&self, ctx: &TaskContext, params: &Value) -> Result<TaskResult>;
}

/// Maps task-type names to handlers. Constructed once at startup and passed
/// to the runner; duplicate registration is a configuration error, caught
/// here rather than at run time.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let task_type = handler.task_type();
        if task_type.is_empty() {
            bail!("handler registered with an empty task type");
        }
        if self.handlers.contains_key(task_type) {
            bail!("duplicate task handler type: '{task_type}'");
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn validate(&self, task_type: &str, params: &Value) -> Result<()> {
        match self.handlers.get(task_type) {
            Some(handler) => handler.validate_params(params),
            None => bail!(
                "unknown task type '{}'; known: {}",
                task_type,
                self.task_types().join(", ")
            ),
        }
    }

    pub fn task_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

/// The registry with every built-in handler wired in.
pub fn builtin_registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(BotCheckin))?;
    registry.register(Arc::new(ButtonCheckin))?;
    registry.register(Arc::new(ChatMonitor))?;
    registry.register(Arc::new(MediaKeepalive))?;
    registry.register(Arc::new(SendMessage))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str);

    #[async_trait]
    impl TaskHandler for Dummy {
        fn task_type(&self) -> &'static str {
            self.0
        }
        fn validate_params(&self, _params: &Value) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _ctx: &TaskContext, _params: &Value) -> Result<TaskResult> {
            Ok(TaskResult::ok("noop"))
        }
    }

    #[test]
    fn duplicate_registration_is_a_hard_error() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Dummy("x"))).expect("first");
        let err = registry
            .register(Arc::new(Dummy("x")))
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn empty_type_name_is_rejected() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register(Arc::new(Dummy(""))).is_err());
    }

    #[test]
    fn validate_names_known_types_for_unknown_lookups() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Dummy("a"))).expect("register");
        let err = registry
            .validate("nope", &Value::Object(Default::default()))
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown task type"));
        assert!(err.to_string().contains("a"));
    }

    #[test]
    fn builtin_registry_exposes_all_handler_types() {
        let registry = builtin_registry().expect("registry");
        assert_eq!(
            registry.task_types(),
            vec![
                "bot_checkin",
                "button_checkin",
                "chat_monitor",
                "media_keepalive",
                "send_message"
            ]
        );
    }
}
