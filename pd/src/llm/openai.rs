//! OpenAI-compatible chat completions client
//!
//! Requests strict JSON-schema output when the caller supplies a schema and
//! enables web search when grounding is requested. URL citations attached to
//! the answer come back as grounding sources.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

use super::{
    CompletionRequest, CompletionResponse, GroundingSource, LlmClient, LlmError, ResearchMode, Role, TokenUsage,
    Tool,
};
use crate::config::LlmConfig;

/// OpenAI API client
pub struct OpenAIClient {
    model: String,
    deep_research_model: Option<String>,
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAIClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        debug!(model = %config.model, base_url = %config.base_url, "from_config: called");
        let api_key = config.api_key().map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            model: config.model.clone(),
            deep_research_model: config.deep_research_model.clone(),
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    fn model_for(&self, mode: ResearchMode) -> &str {
        match (mode, &self.deep_research_model) {
            (ResearchMode::Deep, Some(model)) => model,
            _ => &self.model,
        }
    }

    /// Build the request body for the chat completions API
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        debug!(tag = %request.tag, max_tokens = request.max_tokens, "build_request_body: called");
        let model = self.model_for(request.mode);

        let mut messages = vec![json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        for turn in &request.prior_turns {
            let role = match turn.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": turn.text }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let max_tokens = request.max_tokens.min(self.max_tokens);
        let mut body = json!({
            "model": model,
            "messages": messages,
        });

        // Newer reasoning models use max_completion_tokens instead of max_tokens
        let uses_completion_tokens = model.starts_with("gpt-5") || model.starts_with("o1") || model.starts_with("o3");
        if uses_completion_tokens {
            body["max_completion_tokens"] = json!(max_tokens);
        } else {
            body["max_tokens"] = json!(max_tokens);
        }

        if let Some(schema) = &request.schema {
            debug!(schema = %schema.name, "build_request_body: strict structured output");
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "strict": true,
                    "schema": schema.schema,
                }
            });
        }

        if request.tools.contains(&Tool::WebSearch) {
            debug!("build_request_body: web search enabled");
            body["web_search_options"] = json!({});
        }

        body
    }

    fn parse_response(&self, api_response: OpenAIResponse) -> Result<CompletionResponse, LlmError> {
        debug!(choices = api_response.choices.len(), "parse_response: called");
        let message = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("response had no choices".to_string()))?;

        if let Some(refusal) = message.refusal {
            return Err(LlmError::InvalidResponse(format!("model refused: {}", refusal)));
        }

        let mut grounding_sources: Vec<GroundingSource> = Vec::new();
        for annotation in message.annotations {
            if let Some(citation) = annotation.url_citation
                && !grounding_sources.iter().any(|s| s.url == citation.url)
            {
                grounding_sources.push(GroundingSource {
                    url: citation.url,
                    title: citation.title,
                });
            }
        }

        let usage = api_response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            text: message.content.unwrap_or_default(),
            grounding_sources,
            usage,
            conversation: api_response.id,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(model = %self.model, tag = %request.tag, "complete: called");
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_request_body(&request);

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    debug!("complete: request timed out");
                    LlmError::Timeout(self.timeout)
                } else {
                    debug!(error = %e, "complete: network error");
                    LlmError::Network(e)
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            debug!("complete: rate limited (429)");
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);

            return Err(LlmError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        if !response.status().is_success() {
            debug!(%status, "complete: API error");
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, message: text });
        }

        debug!("complete: success");
        let api_response: OpenAIResponse = response.json().await?;
        self.parse_response(api_response)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    annotations: Vec<OpenAIAnnotation>,
}

#[derive(Debug, Deserialize)]
struct OpenAIAnnotation {
    #[serde(default)]
    url_citation: Option<OpenAIUrlCitation>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUrlCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
