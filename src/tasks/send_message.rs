//! Fire-and-forget message sender. Picks one entry from the configured pool
//! so recurring runs do not post identical text every time.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::model::TaskResult;
use crate::tasks::{TaskContext, TaskHandler};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SendMessageConfig {
    pub messages: Vec<String>,
    pub random_delay_min: f64,
    pub random_delay_max: f64,
}

impl Default for SendMessageConfig {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            random_delay_min: 0.0,
            random_delay_max: 0.0,
        }
    }
}

impl SendMessageConfig {
    fn parse(params: &Value) -> Result<Self> {
        let cfg: Self = serde_json::from_value(params.clone()).context("send_message config")?;
        if cfg.messages.iter().all(|m| m.trim().is_empty()) {
            bail!("send_message needs at least one non-empty message");
        }
        if cfg.random_delay_min > cfg.random_delay_max {
            bail!("random_delay_min must not exceed random_delay_max");
        }
        Ok(cfg)
    }

    fn pick(&self) -> &str {
        let candidates: Vec<&String> = self
            .messages
            .iter()
            .filter(|m| !m.trim().is_empty())
            .collect();
        let idx = if candidates.len() > 1 {
            rand::thread_rng().gen_range(0..candidates.len())
        } else {
            0
        };
        candidates[idx]
    }
}

pub struct SendMessage;

#[async_trait]
impl TaskHandler for SendMessage {
    fn task_type(&self) -> &'static str {
        "send_message"
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        SendMessageConfig::parse(params).map(|_| ())
    }

    async fn execute(&self, ctx: &TaskContext, params: &Value) -> Result<TaskResult> {
        let cfg = SendMessageConfig::parse(params)?;
        let account = ctx.account()?;
        let target = ctx.target()?;

        let client = ctx.collab.chat.acquire(&account.session_name).await?;

        if !ctx.is_manual() && cfg.random_delay_max > 0.0 {
            let delay = rand::thread_rng()
                .gen_range(cfg.random_delay_min.max(0.0)..=cfg.random_delay_max.max(0.0));
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let message = cfg.pick();
        client.send_message(target, message).await?;
        info!(task = %ctx.task.name, %target, "message sent");

        Ok(TaskResult::ok_with(
            "Message sent",
            json!({ "target": target, "message": message }),
        ))
    }
}
