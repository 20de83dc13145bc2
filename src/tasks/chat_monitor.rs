//! Time-boxed chat watcher: observe a peer for a while, record every message
//! hitting the configured pattern, and optionally fire a canned reply at the
//! first hit.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::chat::EventFilter;
use crate::model::TaskResult;
use crate::router::RouterError;
use crate::tasks::patterns::MessagePattern;
use crate::tasks::{TaskContext, TaskHandler};

const POLL_SLICE: Duration = Duration::from_secs(10);
const MAX_RECORDED: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMonitorConfig {
    pub watch_patterns: MessagePattern,
    /// Sent once, on the first matching message.
    pub reply: Option<String>,
    /// How long to observe the chat, in seconds.
    pub duration: u64,
    /// Restrict matching to messages sent by the peer itself.
    pub from_peer_only: bool,
}

impl Default for ChatMonitorConfig {
    fn default() -> Self {
        Self {
            watch_patterns: MessagePattern::default(),
            reply: None,
            duration: 60,
            from_peer_only: true,
        }
    }
}

impl ChatMonitorConfig {
    fn parse(params: &Value) -> Result<Self> {
        let cfg: Self = serde_json::from_value(params.clone()).context("chat_monitor config")?;
        if cfg.watch_patterns.keywords.is_empty() && cfg.watch_patterns.regex.is_none() {
            bail!("chat_monitor needs keywords or a regex to watch for");
        }
        cfg.watch_patterns.check()?;
        if cfg.duration == 0 {
            bail!("chat_monitor duration must be positive");
        }
        Ok(cfg)
    }
}

pub struct ChatMonitor;

#[async_trait]
impl TaskHandler for ChatMonitor {
    fn task_type(&self) -> &'static str {
        "chat_monitor"
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        ChatMonitorConfig::parse(params).map(|_| ())
    }

    async fn execute(&self, ctx: &TaskContext, params: &Value) -> Result<TaskResult> {
        let cfg = ChatMonitorConfig::parse(params)?;
        let account = ctx.account()?;
        let target = ctx.target()?;

        let client = ctx.collab.chat.acquire(&account.session_name).await?;
        ctx.collab.router.register_source(account.id, &client).await;
        let peer_id = client.resolve_peer(target).await?;

        let filter = if cfg.from_peer_only {
            EventFilter::from_sender(peer_id)
        } else {
            EventFilter::any()
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(cfg.duration);
        info!(task = %ctx.task.name, %target, duration = cfg.duration, "monitoring chat");

        let mut hits: Vec<String> = Vec::new();
        let mut replied = false;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let slice = (deadline - now).min(POLL_SLICE);
            let event = match ctx
                .collab
                .router
                .wait_for(account.id, peer_id, filter, slice)
                .await
            {
                Ok(event) => event,
                Err(RouterError::Timeout { .. }) => continue,
            };

            if !cfg.watch_patterns.is_match(&event.text) {
                continue;
            }
            debug!(task = %ctx.task.name, text = %event.text, "pattern hit");
            if hits.len() < MAX_RECORDED {
                hits.push(event.text.clone());
            }
            if !replied {
                if let Some(reply) = cfg.reply.as_deref() {
                    client.send_message(target, reply).await?;
                    info!(task = %ctx.task.name, "auto-reply sent");
                    replied = true;
                }
            }
        }

        Ok(TaskResult::ok_with(
            format!("Observed {} matching message(s)", hits.len()),
            json!({ "matches": hits, "replied": replied }),
        ))
    }
}
