//! Media-server keepalive: simulate a short playback session against an
//! Emby-compatible HTTP API so dormant accounts keep their watch activity.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::model::TaskResult;
use crate::tasks::{TaskContext, TaskHandler};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);
/// Emby reports positions in ticks of 100ns.
const TICKS_PER_SECOND: u64 = 10_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaKeepaliveConfig {
    pub base_url: String,
    pub api_token: String,
    pub user_id: String,
    pub play_time_min: u64,
    pub play_time_max: u64,
    pub device_name: String,
}

impl Default for MediaKeepaliveConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            user_id: String::new(),
            play_time_min: 30,
            play_time_max: 90,
            device_name: "rollcall".to_string(),
        }
    }
}

impl MediaKeepaliveConfig {
    fn parse(params: &Value) -> Result<Self> {
        let cfg: Self =
            serde_json::from_value(params.clone()).context("media_keepalive config")?;
        if cfg.base_url.trim().is_empty() {
            bail!("media_keepalive needs a base_url");
        }
        if cfg.api_token.trim().is_empty() {
            bail!("media_keepalive needs an api_token");
        }
        if cfg.user_id.trim().is_empty() {
            bail!("media_keepalive needs a user_id");
        }
        if cfg.play_time_min > cfg.play_time_max {
            bail!("play_time_min must not exceed play_time_max");
        }
        Ok(cfg)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

pub struct MediaKeepalive;

impl MediaKeepalive {
    async fn pick_item(
        &self,
        http: &reqwest::Client,
        cfg: &MediaKeepaliveConfig,
        device_id: &str,
    ) -> Result<(String, String)> {
        let url = cfg.endpoint(&format!("Users/{}/Items", cfg.user_id));
        let body: Value = http
            .get(&url)
            .header("X-Emby-Token", &cfg.api_token)
            .header("X-Emby-Device-Id", device_id)
            .query(&[
                ("IncludeItemTypes", "Movie,Episode"),
                ("Recursive", "true"),
                ("SortBy", "Random"),
                ("Limit", "1"),
            ])
            .send()
            .await
            .context("item listing request")?
            .error_for_status()
            .context("item listing failed")?
            .json()
            .await
            .context("item listing body")?;

        let item = body
            .pointer("/Items/0")
            .ok_or_else(|| anyhow::anyhow!("media library returned no items"))?;
        let id = item
            .pointer("/Id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("item has no id"))?;
        let name = item
            .pointer("/Name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        Ok((id.to_string(), name.to_string()))
    }

    async fn report(
        &self,
        http: &reqwest::Client,
        cfg: &MediaKeepaliveConfig,
        device_id: &str,
        path: &str,
        item_id: &str,
        position_secs: u64,
    ) -> Result<()> {
        http.post(cfg.endpoint(path))
            .header("X-Emby-Token", &cfg.api_token)
            .header("X-Emby-Device-Id", device_id)
            .json(&json!({
                "ItemId": item_id,
                "PositionTicks": position_secs * TICKS_PER_SECOND,
                "PlayMethod": "DirectStream",
                "DeviceName": cfg.device_name,
            }))
            .send()
            .await
            .with_context(|| format!("playback report to {path}"))?
            .error_for_status()
            .with_context(|| format!("playback report to {path} rejected"))?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for MediaKeepalive {
    fn task_type(&self) -> &'static str {
        "media_keepalive"
    }

    fn validate_params(&self, params: &Value) -> Result<()> {
        MediaKeepaliveConfig::parse(params).map(|_| ())
    }

    async fn execute(&self, ctx: &TaskContext, params: &Value) -> Result<TaskResult> {
        let cfg = MediaKeepaliveConfig::parse(params)?;
        let http = reqwest::Client::new();
        // A fresh device identity per session keeps the server from merging
        // reports into a stale playback session.
        let device_id = uuid::Uuid::new_v4().simple().to_string();

        let (item_id, item_name) = self.pick_item(&http, &cfg, &device_id).await?;
        let play_time = if cfg.play_time_max > cfg.play_time_min {
            rand::thread_rng().gen_range(cfg.play_time_min..=cfg.play_time_max)
        } else {
            cfg.play_time_min
        };
        info!(task = %ctx.task.name, item = %item_name, play_time, "starting playback simulation");

        self.report(&http, &cfg, &device_id, "Sessions/Playing", &item_id, 0)
            .await?;

        let mut played = 0u64;
        while played < play_time {
            let step = (play_time - played).min(PROGRESS_INTERVAL.as_secs());
            tokio::time::sleep(Duration::from_secs(step)).await;
            played += step;
            self.report(
                &http,
                &cfg,
                &device_id,
                "Sessions/Playing/Progress",
                &item_id,
                played,
            )
            .await?;
            debug!(task = %ctx.task.name, played, "playback progress reported");
        }

        self.report(
            &http,
            &cfg,
            &device_id,
            "Sessions/Playing/Stopped",
            &item_id,
            played,
        )
        .await?;

        Ok(TaskResult::ok_with(
            format!("Played '{item_name}' for {played}s"),
            json!({ "item_id": item_id, "item_name": item_name, "seconds": played }),
        ))
    }
}
