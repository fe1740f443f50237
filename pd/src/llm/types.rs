//! Request and response types for reasoning service calls

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a prior turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One earlier exchange replayed to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Server-side tools the service may use while answering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    WebSearch,
}

/// How much effort the service should spend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    #[default]
    Standard,
    Deep,
}

/// JSON schema the answer must conform to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

/// A single reasoning service call
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Caller label, `stage:entity_id` with `:step` appended by the reasoning loop
    pub tag: String,
    pub system_prompt: String,
    pub prompt: String,
    pub prior_turns: Vec<Turn>,
    pub tools: Vec<Tool>,
    pub schema: Option<ResponseSchema>,
    pub mode: ResearchMode,
    pub max_tokens: u32,
    /// Opaque server-side conversation handle from an earlier response
    pub conversation: Option<String>,
}

impl CompletionRequest {
    pub fn new(tag: impl Into<String>, system_prompt: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            system_prompt: system_prompt.into(),
            prompt: prompt.into(),
            prior_turns: Vec::new(),
            tools: Vec::new(),
            schema: None,
            mode: ResearchMode::Standard,
            max_tokens: 4096,
            conversation: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.schema = Some(ResponseSchema {
            name: name.into(),
            schema,
        });
        self
    }

    pub fn with_prior_turns(mut self, turns: Vec<Turn>) -> Self {
        self.prior_turns = turns;
        self
    }

    pub fn with_mode(mut self, mode: ResearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A document or URL cited as support for an answer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroundingSource {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl GroundingSource {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
        }
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Answer from the reasoning service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub grounding_sources: Vec<GroundingSource>,
    pub usage: TokenUsage,
    pub conversation: Option<String>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_sources<S: Into<String>>(mut self, urls: impl IntoIterator<Item = S>) -> Self {
        self.grounding_sources = urls.into_iter().map(GroundingSource::url).collect();
        self
    }
}
