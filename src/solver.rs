//! Challenge solving. The engine only needs "image plus candidate labels in,
//! chosen label out"; the shipped implementation speaks the OpenAI-compatible
//! chat completions API with the image inlined as a data URL.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::settings::Settings;

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    /// Pick the candidate label that best describes the image.
    async fn solve(&self, image: &[u8], options: &[String]) -> Result<String>;
}

pub struct OpenAiSolver {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiSolver {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let api_key = settings
            .solver_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("solver API key not configured"))?;
        Ok(Self::new(
            &settings.solver_base_url,
            api_key,
            &settings.solver_model,
        ))
    }
}

#[async_trait]
impl ChallengeSolver for OpenAiSolver {
    async fn solve(&self, image: &[u8], options: &[String]) -> Result<String> {
        let prompt = format!(
            "Identify what the image shows and pick the best matching option.\n\
             Options: {}\n\
             Reply with the option text only, no explanation.",
            options.join(", ")
        );
        let payload = json!({
            "model": self.model,
            "max_tokens": 50,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/jpeg;base64,{}", BASE64.encode(image))
                        }
                    }
                ]
            }]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("solver request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "solver API error: {} {}",
                status,
                body.chars().take(200).collect::<String>()
            );
        }

        let body: Value = response.json().await.context("solver response body")?;
        let answer = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("solver returned no content"))?;
        Ok(answer.trim().to_string())
    }
}
