//! Panel-click check-in: request the bot's menu, press the configured
//! button, and read the outcome from the callback answer or a follow-up
//! message. Bots in this family often stay silent after the press, so a
//! clean click with no reply counts as success.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::chat::EventFilter;
use crate::model::TaskResult;
use crate::router::RouterError;
use crate::tasks::patterns::MessagePattern;
use crate::tasks::{TaskContext, TaskHandler};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonCheckinConfig {
    pub command: String,
    /// A button whose label contains any of these is the one to press.
    pub button_keywords: Vec<String>,
    pub random_delay_min: f64,
    pub random_delay_max: f64,
    /// Seconds to wait for the menu message carrying the button.
    pub panel_timeout: u64,
    /// Seconds to wait for a reply after the press before assuming success.
    pub reply_timeout: u64,

    pub success_patterns: MessagePattern,
    pub already_checked_patterns: MessagePattern,
    pub fail_patterns: MessagePattern,
}

impl Default for ButtonCheckinConfig {
    fn default() -> Self {
        Self {
            command: "/start".to_string(),
            button_keywords: vec!["签到".to_string(), "check".to_string()],
            random_delay_min: 2.0,
            random_delay_max: 5.0,
            panel_timeout: 30,
            reply_timeout: 10,
            success_patterns: MessagePattern::keywords(&["签到成功", "成功", "获得", "恭喜"]),
            already_checked_patterns: MessagePattern::keywords(&[
                "已签到",
                "已经签到",
                "重复签到",
            ]),
            fail_patterns: MessagePattern::keywords(&["失败", "错误"]),
        }
    }
}

impl ButtonCheckinConfig {
    fn parse(params: &Value) -> Result<Self> {
        let cfg: Self = serde_json::from_value(params.clone()).context("button_checkin config")?;
        if cfg.button_keywords.iter().all(|k| k.trim().is_empty()) {
            anyhow::bail!("button_checkin needs at least one button keyword");
        }
        if cfg.random_delay_min > cfg.random_delay_max {
            anyhow::bail!("random_delay_min must not exceed random_delay_max");
        }
        cfg.success_patterns.check()?;
        cfg.already_checked_patterns.check()?;
        cfg.fail_patterns.check()?;
        Ok(cfg)
    }

    fn pick_button(&self, labels: &[String]) -> Option<String> {
        labels
            .iter()
            .find(|label| {
                let lowered = label.to_lowercase();
                self.button_keywords
                    .iter()
                    .any(|kw| !kw.trim().is_empty() && lowered.contains(&kw.to_lowercase()))
            })
            .cloned()
    }

    fn classify_reply(&self, text: &str) -> Option<TaskResult> {
        if self.already_checked_patterns.is_match(text) {
            return Some(TaskResult::ok_with(
                "Already checked in today",
                json!({ "already_checked": true, "response": text }),
            ));
        }
        if self.success_patterns.is_match(text) {
            return Some(TaskResult::ok_with(
                "Checkin success",
                json!({ "response": text }),
            ));
        }
        if self.fail_patterns.is_match(text) {
            let clipped: String = text.chars().take(100).collect();
            return Some(TaskResult::fail_with(
                format!("Checkin failed: {clipped}"),
                json!({ "response": text }),
            ));
        }
        None
    }
}

pub struct ButtonCheckin;

#[async_trait]
impl TaskHandler for ButtonCheckin {
    fn task_type(&self) -> &'static str {
        "button_checkin"
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        ButtonCheckinConfig::parse(params).map(|_| ())
    }

    async fn execute(&self, ctx: &TaskContext, params: &Value) -> Result<TaskResult> {
        let cfg = ButtonCheckinConfig::parse(params)?;
        let account = ctx.account()?;
        let target = ctx.target()?;

        let client = ctx.collab.chat.acquire(&account.session_name).await?;
        ctx.collab.router.register_source(account.id, &client).await;
        let peer_id = client.resolve_peer(target).await?;
        ctx.collab.router.clear(account.id, peer_id).await;

        if !ctx.is_manual() && cfg.random_delay_max > 0.0 {
            let delay = rand::thread_rng()
                .gen_range(cfg.random_delay_min.max(0.0)..=cfg.random_delay_max.max(0.0));
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        client.send_message(target, &cfg.command).await?;
        info!(task = %ctx.task.name, %target, command = %cfg.command, "requested checkin panel");

        let panel = match ctx
            .collab
            .router
            .wait_for(
                account.id,
                peer_id,
                EventFilter::from_sender(peer_id).with_buttons(),
                Duration::from_secs(cfg.panel_timeout.max(1)),
            )
            .await
        {
            Ok(event) => event,
            Err(RouterError::Timeout { .. }) => {
                return Ok(TaskResult::fail("Timeout waiting for checkin panel"));
            }
        };

        let labels = panel.button_labels();
        let Some(label) = cfg.pick_button(&labels) else {
            return Ok(TaskResult::fail_with(
                "No matching button on panel",
                json!({ "buttons": labels }),
            ));
        };
        info!(task = %ctx.task.name, %label, "pressing checkin button");

        let callback = client.click(&panel, &label).await?;
        if let Some(answer) = callback.as_deref() {
            debug!(task = %ctx.task.name, %answer, "callback answered");
            if let Some(result) = cfg.classify_reply(answer) {
                return Ok(result);
            }
        }

        match ctx
            .collab
            .router
            .wait_for(
                account.id,
                peer_id,
                EventFilter::from_sender(peer_id),
                Duration::from_secs(cfg.reply_timeout.max(1)),
            )
            .await
        {
            Ok(event) => {
                if let Some(result) = cfg.classify_reply(&event.text) {
                    return Ok(result);
                }
                Ok(TaskResult::ok_with(
                    "Button pressed",
                    json!({ "response": event.text }),
                ))
            }
            Err(RouterError::Timeout { .. }) => {
                debug!(task = %ctx.task.name, "no reply after press, assuming success");
                Ok(TaskResult::ok_with(
                    "Button pressed, no reply",
                    json!({ "callback": callback }),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_params() {
        let cfg = ButtonCheckinConfig::parse(&json!({})).expect("defaults");
        assert_eq!(cfg.command, "/start");
        assert_eq!(cfg.panel_timeout, 30);
    }

    #[test]
    fn empty_keyword_list_is_rejected() {
        assert!(ButtonCheckinConfig::parse(&json!({ "button_keywords": [] })).is_err());
        assert!(ButtonCheckinConfig::parse(&json!({ "button_keywords": ["  "] })).is_err());
    }

    #[test]
    fn pick_button_matches_case_insensitively() {
        let cfg = ButtonCheckinConfig::default();
        let labels = vec!["💰 余额".to_string(), "📅 每日签到".to_string()];
        assert_eq!(cfg.pick_button(&labels), Some("📅 每日签到".to_string()));

        let en = vec!["Daily Check-In".to_string()];
        assert_eq!(cfg.pick_button(&en), Some("Daily Check-In".to_string()));
        assert_eq!(cfg.pick_button(&["余额".to_string()]), None);
    }

    #[test]
    fn reply_classification_covers_the_three_outcomes() {
        let cfg = ButtonCheckinConfig::default();
        assert!(cfg.classify_reply("签到成功 +5").expect("hit").success);
        let already = cfg.classify_reply("今日已签到").expect("hit");
        assert!(already.success);
        assert!(!cfg.classify_reply("签到失败").expect("hit").success);
        assert!(cfg.classify_reply("unrelated chatter").is_none());
    }
}
