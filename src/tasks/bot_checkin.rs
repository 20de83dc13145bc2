//! Command-reply check-in: send a command to a bot, classify its replies,
//! and solve an image challenge when one appears mid-conversation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::chat::{ChatClient, ChatEvent, EventFilter};
use crate::model::TaskResult;
use crate::router::RouterError;
use crate::tasks::patterns::{MessagePattern, best_match, clean_text};
use crate::tasks::{TaskContext, TaskHandler};

/// Each poll of the router is capped so the loop can re-check the overall
/// deadline even when the bot stays silent.
const POLL_SLICE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotCheckinConfig {
    pub command: String,
    pub random_delay_min: f64,
    pub random_delay_max: f64,
    /// Overall wait for a terminal reply, in seconds. Must stay below the
    /// task's max runtime or the attempt deadline fires first.
    pub timeout: u64,

    pub use_ai: bool,
    pub captcha_has_image: bool,
    pub captcha_has_buttons: bool,

    pub success_patterns: MessagePattern,
    pub already_checked_patterns: MessagePattern,
    pub fail_patterns: MessagePattern,
    pub ignore_patterns: MessagePattern,
    pub account_error_patterns: MessagePattern,
}

impl Default for BotCheckinConfig {
    fn default() -> Self {
        Self {
            command: "/checkin".to_string(),
            random_delay_min: 2.0,
            random_delay_max: 5.0,
            timeout: 60,
            use_ai: false,
            captcha_has_image: true,
            captcha_has_buttons: true,
            success_patterns: MessagePattern {
                keywords: ["签到成功", "成功签到", "获得", "积分", "恭喜", "完成签到"]
                    .map(String::from)
                    .to_vec(),
                regex: None,
                extract_regex: Some(r"[+＋]?\s*(\d+)\s*[积分点]".to_string()),
            },
            already_checked_patterns: MessagePattern::keywords(&[
                "今天已签到",
                "已经签到",
                "今日已签到",
                "已签到",
                "重复签到",
                "签到机会已用完",
                "已用完",
            ]),
            fail_patterns: MessagePattern::keywords(&[
                "失败",
                "错误",
                "验证码错误",
                "回答错误",
                "超时",
                "过期",
                "无效",
            ]),
            ignore_patterns: MessagePattern::keywords(&["会话已取消", "没有活跃的会话"]),
            account_error_patterns: MessagePattern::keywords(&[
                "黑名单",
                "封禁",
                "禁止",
                "未注册",
                "不存在",
                "未绑定",
            ]),
        }
    }
}

impl BotCheckinConfig {
    fn parse(params: &Value) -> Result<Self> {
        let cfg: Self = serde_json::from_value(params.clone()).context("bot_checkin config")?;
        if cfg.random_delay_min > cfg.random_delay_max {
            anyhow::bail!("random_delay_min must not exceed random_delay_max");
        }
        cfg.success_patterns.check()?;
        cfg.already_checked_patterns.check()?;
        cfg.fail_patterns.check()?;
        cfg.ignore_patterns.check()?;
        cfg.account_error_patterns.check()?;
        Ok(cfg)
    }
}

/// How a single reply advances the interaction. Ordered rules: ignore wins
/// over everything, already-done over success, success over failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReplyClass {
    Ignore,
    AlreadyDone,
    Success(Option<String>),
    Failure,
    AccountBlocked,
    Unrecognized,
}

pub(crate) fn classify(text: &str, cfg: &BotCheckinConfig) -> ReplyClass {
    if cfg.ignore_patterns.is_match(text) {
        return ReplyClass::Ignore;
    }
    if cfg.already_checked_patterns.is_match(text) {
        return ReplyClass::AlreadyDone;
    }
    if cfg.success_patterns.is_match(text) {
        return ReplyClass::Success(cfg.success_patterns.extract(text));
    }
    if cfg.fail_patterns.is_match(text) {
        return ReplyClass::Failure;
    }
    if cfg.account_error_patterns.is_match(text) {
        return ReplyClass::AccountBlocked;
    }
    ReplyClass::Unrecognized
}

fn clip(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

pub struct BotCheckin;

#[async_trait]
impl TaskHandler for BotCheckin {
    fn task_type(&self) -> &'static str {
        "bot_checkin"
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        BotCheckinConfig::parse(params).map(|_| ())
    }

    async fn execute(&self, ctx: &TaskContext, params: &Value) -> Result<TaskResult> {
        let cfg = BotCheckinConfig::parse(params)?;
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
        info!(task = %ctx.task.name, %target, command = %cfg.command, "sent checkin command");

        self.await_outcome(ctx, &client, peer_id, &cfg).await
    }
}

impl BotCheckin {
    async fn await_outcome(
        &self,
        ctx: &TaskContext,
        client: &Arc<dyn ChatClient>,
        peer_id: i64,
        cfg: &BotCheckinConfig,
    ) -> Result<TaskResult> {
        let account = ctx.account()?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(cfg.timeout.max(1));
        let filter = EventFilter::from_sender(peer_id);

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

            let text = event.text.as_str();
            debug!(task = %ctx.task.name, reply = %clip(text, 100), "received reply");

            if cfg.ignore_patterns.is_match(text) {
                continue;
            }

            let looks_like_challenge =
                event.has_photo && (!cfg.captcha_has_buttons || event.has_buttons());
            if cfg.use_ai && looks_like_challenge {
                if let Some(result) = self.handle_challenge(ctx, client, &event).await {
                    return Ok(result);
                }
                continue;
            }

            match classify(text, cfg) {
                ReplyClass::Ignore => continue,
                ReplyClass::AlreadyDone => {
                    return Ok(TaskResult::ok_with(
                        "Already checked in today",
                        json!({ "already_checked": true, "response": text }),
                    ));
                }
                ReplyClass::Success(extracted) => {
                    return Ok(TaskResult::ok_with(
                        format!(
                            "Checkin success, extracted: {}",
                            extracted.as_deref().unwrap_or("N/A")
                        ),
                        json!({ "extracted": extracted, "response": text }),
                    ));
                }
                ReplyClass::Failure => {
                    return Ok(TaskResult::fail_with(
                        format!("Checkin failed: {}", clip(text, 100)),
                        json!({ "response": text }),
                    ));
                }
                ReplyClass::AccountBlocked => {
                    return Ok(TaskResult::fail_with(
                        format!("Account issue: {}", clip(text, 100)),
                        json!({ "response": text }),
                    ));
                }
                ReplyClass::Unrecognized => {
                    debug!(task = %ctx.task.name, "unrecognized reply, still waiting");
                }
            }
        }

        Ok(TaskResult::fail("Timeout waiting for checkin result"))
    }

    /// Attempt the image challenge. Returns `Some` only for terminal
    /// malformed-panel outcomes; `None` means keep waiting, either because
    /// the option was clicked or because solving failed and the bot may
    /// re-prompt.
    async fn handle_challenge(
        &self,
        ctx: &TaskContext,
        client: &Arc<dyn ChatClient>,
        event: &ChatEvent,
    ) -> Option<TaskResult> {
        let options = event.button_labels();
        if options.is_empty() {
            return Some(TaskResult::fail("No challenge options found"));
        }

        let pairs: Vec<(String, String)> = options
            .iter()
            .map(|label| (label.clone(), clean_text(label)))
            .collect();
        let cleaned: Vec<String> = pairs
            .iter()
            .map(|(_, c)| c.clone())
            .filter(|c| !c.is_empty())
            .collect();
        if cleaned.is_empty() {
            return Some(TaskResult::fail("Empty challenge options"));
        }
        info!(task = %ctx.task.name, ?options, "challenge detected");

        let image = match client.download_media(event).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(task = %ctx.task.name, error = %e, "challenge media download failed");
                return None;
            }
        };
        let answer = match ctx.collab.solver.solve(&image, &cleaned).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(task = %ctx.task.name, error = %e, "challenge solving failed");
                return None;
            }
        };
        info!(task = %ctx.task.name, %answer, "solver answered");

        let matched = best_match(&answer, &options).cloned().or_else(|| {
            best_match(&answer, &cleaned).and_then(|hit| {
                pairs
                    .iter()
                    .find(|(_, c)| c == hit)
                    .map(|(label, _)| label.clone())
            })
        });
        let Some(label) = matched else {
            error!(task = %ctx.task.name, %answer, "cannot map answer to any option");
            return None;
        };

        if !ctx.is_manual() {
            let delay = rand::thread_rng().gen_range(1.0..=3.0);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }
        info!(task = %ctx.task.name, %label, "clicking challenge option");
        if let Err(e) = client.click(event, &label).await {
            error!(task = %ctx.task.name, error = %e, "challenge click failed");
        }
        None
    }
}
