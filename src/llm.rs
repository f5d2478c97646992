//! Language-model collaborator.
//!
//! The agent talks to models only through [`LanguageModel::complete`]:
//! a prompt plus tool definitions in, free text or a single tool call out.
//! Provider selection, API keys and retry policy live here.
//!
//! - **[`OpenAIChatModel`]**: OpenAI-compatible `POST /chat/completions`
//!   with function tools, low temperature, and the same 429/5xx backoff
//!   as the embedding client.
//! - **[`DisabledModel`]**: fails every call; used when `[llm].provider`
//!   is `disabled`, e.g. for catalog-only commands.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::ModelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// A function the model may call, described by a JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(
        &self,
        prompt: &Prompt,
        tools: &[ToolDefinition],
    ) -> Result<Completion, ModelError>;
}

pub fn create_model(config: &LlmConfig) -> anyhow::Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        other => anyhow::bail!("Unknown llm provider: {}", other),
    }
}

pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _: &Prompt, _: &[ToolDefinition]) -> Result<Completion, ModelError> {
        Err(ModelError::Unavailable(
            "llm provider is disabled; set [llm].provider in the config".to_string(),
        ))
    }
}

pub struct OpenAIChatModel {
    model: String,
    temperature: f32,
    timeout: Duration,
    max_retries: u32,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIChatModel {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout(),
            max_retries: config.max_retries,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            client,
        })
    }

    fn request_body(&self, prompt: &Prompt, tools: &[ToolDefinition]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
        });
        if !tools.is_empty() {
            let tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(tools);
            body["tool_choice"] = serde_json::Value::String("auto".to_string());
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        tools: &[ToolDefinition],
    ) -> Result<Completion, ModelError> {
        let body = self.request_body(prompt, tools);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| ModelError::Malformed(e.to_string()))?;
                        log_usage(&json);
                        return parse_chat_completion(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(%status, attempt, "chat completion failed, retrying");
                        last_err = Some(ModelError::Unavailable(format!(
                            "API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    return Err(ModelError::Unavailable(format!(
                        "API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) if e.is_timeout() => return Err(ModelError::Timeout(self.timeout)),
                Err(e) => {
                    last_err = Some(ModelError::Unavailable(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| ModelError::Unavailable("completion failed after retries".into())))
    }
}

fn log_usage(json: &serde_json::Value) {
    if let Some(usage) = json.get("usage") {
        tracing::debug!(
            prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()),
            completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()),
            total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64()),
            "model token usage"
        );
    }
}

/// Read the first choice as a tool call (preferred) or text.
pub fn parse_chat_completion(json: &serde_json::Value) -> Result<Completion, ModelError> {
    let message = json
        .pointer("/choices/0/message")
        .ok_or_else(|| ModelError::Malformed("missing choices[0].message".into()))?;

    if let Some(call) = message.pointer("/tool_calls/0/function") {
        let name = call
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| ModelError::Malformed("tool call without a name".into()))?;
        let arguments = match call.get("arguments") {
            Some(serde_json::Value::String(raw)) => serde_json::from_str(raw).map_err(|e| {
                ModelError::Malformed(format!("tool arguments are not JSON: {}", e))
            })?,
            Some(value) => value.clone(),
            None => serde_json::Value::Object(Default::default()),
        };
        return Ok(Completion::ToolCall {
            name: name.to_string(),
            arguments,
        });
    }

    match message.get("content").and_then(|c| c.as_str()) {
        Some(text) => Ok(Completion::Text(text.to_string())),
        None => Err(ModelError::Malformed(
            "response has neither content nor tool calls".into(),
        )),
    }
}
