//! Shared services handed to every stage handler

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, Tool};
use crate::poller::CompletionPoller;
use crate::prompts::PromptLoader;
use crate::queue::TaskQueue;
use crate::reasoning::{ReasoningController, parse_json};
use crate::retry::{Classifier, RetryPolicy, execute_with_retry};
use crate::state::StateManager;

/// Calls allowed for one structured answer that fails to decode
const PARSE_ATTEMPTS: u32 = 2;

/// A decoded structured answer with the raw response it came from
#[derive(Debug, Clone)]
pub struct Structured<T> {
    pub value: T,
    pub response: CompletionResponse,
}

/// One structured question for the reasoning service
pub struct Ask<'a, C: Serialize> {
    pub tag: &'a str,
    pub template: &'a str,
    pub context: &'a C,
    pub schema_name: &'a str,
    pub schema: Value,
    pub web_search: bool,
}

pub struct StageContext {
    pub config: Config,
    pub state: StateManager,
    pub queue: TaskQueue,
    pub poller: CompletionPoller,
    pub llm: Arc<dyn LlmClient>,
    pub prompts: Arc<PromptLoader>,
    pub reasoning: ReasoningController,
    pub retry: RetryPolicy,
    pub classifier: Classifier,
}

impl StageContext {
    /// Single structured call: transient failures retry through the policy,
    /// undecodable answers get one more call before failing as internal
    pub async fn ask<T, C>(&self, ask: Ask<'_, C>) -> PipelineResult<Structured<T>>
    where
        T: DeserializeOwned,
        C: Serialize,
    {
        debug!(tag = %ask.tag, template = %ask.template, "ask: called");
        let system = self.prompts.system().map_err(|e| PipelineError::Internal(e.to_string()))?;
        let prompt = self
            .prompts
            .render(ask.template, ask.context)
            .map_err(|e| PipelineError::Internal(e.to_string()))?;
        let mut request = CompletionRequest::new(ask.tag, system, prompt)
            .with_schema(ask.schema_name, ask.schema)
            .with_max_tokens(self.config.reasoning.max_tokens);
        if ask.web_search {
            request = request.with_tools(vec![Tool::WebSearch]);
        }

        let mut last_error = None;
        for attempt in 1..=PARSE_ATTEMPTS {
            let response = execute_with_retry(
                || {
                    let request = request.clone();
                    async move { self.llm.complete(request).await }
                },
                &self.retry,
                &self.classifier,
            )
            .await?;

            match parse_json::<T>(&response.text) {
                Ok(value) => return Ok(Structured { value, response }),
                Err(e) => {
                    warn!(tag = %ask.tag, attempt, error = %e, "Unparseable structured answer");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .map(PipelineError::from)
            .unwrap_or_else(|| PipelineError::Internal(format!("{}: no answer", ask.tag))))
    }
}
