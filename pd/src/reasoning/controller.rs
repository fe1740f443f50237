//! Multi-round reasoning loop controller
//!
//! A bounded state machine around the reasoning service:
//!
//! ```text
//! [Research] -> Direct -> Verify -> FilterPromote -> Done
//!                 ^  |       |
//!                 |  v       v
//!                Retry    Estimate -> Done | Failed
//! ```
//!
//! `Retry` is entered for "no result", an ungrounded answer, a malformed
//! answer, or a failed verification, all drawing on one shared retry budget.
//! `Estimate` runs at most once.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::answer::{Answer, Candidate, answer_schema, parse_answer};
use super::evidence::{EvidenceTier, Verdict, parse_verdict, verdict_schema};
use crate::config::ReasoningConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::llm::{CompletionRequest, CompletionResponse, GroundingSource, LlmClient, ResearchMode, TokenUsage, Tool, Turn};
use crate::prompts::PromptLoader;
use crate::retry::{Classifier, RetryPolicy, execute_with_retry};

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Direct,
    Retry,
    Verify,
    FilterPromote,
    Estimate,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Every candidate met the evidence threshold
    Verified,
    /// Retries ran out; only candidates meeting the threshold were kept
    PartiallyVerified,
    /// Inferred answer from the fallback phase; lower trust
    Estimated,
    Failed,
}

/// A candidate with the tier the verifier gave it, if it was verified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub tier: Option<EvidenceTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub phase: Phase,
    pub prompt: String,
    pub response: String,
}

/// One question for the loop to answer
#[derive(Debug, Clone)]
pub struct ReasoningTask {
    /// Request tag prefix, e.g. the stage name
    pub tag: String,
    pub question: String,
    pub context: String,
}

impl ReasoningTask {
    pub fn new(tag: impl Into<String>, question: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            question: question.into(),
            context: context.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub resolution: Resolution,
    pub primary: Option<RankedCandidate>,
    pub alternatives: Vec<RankedCandidate>,
    pub sources: Vec<GroundingSource>,
    pub transcript: Vec<TranscriptEntry>,
    pub direct_attempts: u32,
    pub verify_attempts: u32,
    pub estimate_attempts: u32,
    pub usage: TokenUsage,
}

impl LoopOutcome {
    pub fn is_failed(&self) -> bool {
        self.resolution == Resolution::Failed
    }
}

/// Mutable loop state between phases
#[derive(Default)]
struct LoopState {
    retries_left: u32,
    feedback: Option<String>,
    candidates: Vec<Candidate>,
    sources: Vec<GroundingSource>,
    /// Best verified subset seen so far, for the partial-success exit
    partial: Vec<RankedCandidate>,
    promote: Vec<RankedCandidate>,
    resolution: Option<Resolution>,
    last_exchange: Vec<Turn>,
    transcript: Vec<TranscriptEntry>,
    direct_attempts: u32,
    verify_attempts: u32,
    estimate_attempts: u32,
    usage: TokenUsage,
}

impl LoopState {
    /// Spend a retry, or pick the exit once they are gone
    fn retry_or_fallback(&mut self) -> Phase {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            debug!(retries_left = self.retries_left, "LoopState: retrying");
            return Phase::Retry;
        }
        if self.partial.is_empty() {
            Phase::Estimate
        } else {
            self.promote = std::mem::take(&mut self.partial);
            self.resolution = Some(Resolution::PartiallyVerified);
            Phase::FilterPromote
        }
    }
}

pub struct ReasoningController {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLoader>,
    config: ReasoningConfig,
    retry: RetryPolicy,
    classifier: Classifier,
}

impl ReasoningController {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: Arc<PromptLoader>, config: ReasoningConfig) -> Self {
        Self {
            llm,
            prompts,
            config,
            retry: RetryPolicy::default(),
            classifier: Classifier::standard(),
        }
    }

    /// Policy for transient reasoning-service failures within a single call
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Drive the loop to a terminal phase.
    ///
    /// Malformed answers never escape; collaborator failures that outlast
    /// the retry policy do.
    pub async fn run(&self, task: &ReasoningTask) -> PipelineResult<LoopOutcome> {
        debug!(tag = %task.tag, deep_research = self.config.deep_research, "run: called");
        let mut state = LoopState {
            retries_left: self.config.max_retries,
            ..Default::default()
        };

        let mut phase = if self.config.deep_research {
            Phase::Research
        } else {
            Phase::Direct
        };

        while !phase.is_terminal() {
            debug!(?phase, "run: entering phase");
            phase = match phase {
                Phase::Research => self.research(task, &mut state).await?,
                Phase::Direct | Phase::Retry => self.direct(task, &mut state, phase).await?,
                Phase::Verify => self.verify(task, &mut state).await?,
                Phase::FilterPromote => Phase::Done,
                Phase::Estimate => self.estimate(task, &mut state).await?,
                Phase::Done | Phase::Failed => phase,
            };
        }

        let resolution = match phase {
            Phase::Failed => Resolution::Failed,
            _ => state.resolution.unwrap_or(Resolution::Failed),
        };
        let mut ranked = std::mem::take(&mut state.promote).into_iter();
        let primary = if resolution == Resolution::Failed {
            None
        } else {
            ranked.next()
        };
        let alternatives: Vec<RankedCandidate> = if primary.is_some() { ranked.collect() } else { Vec::new() };

        info!(
            tag = %task.tag,
            ?resolution,
            direct_attempts = state.direct_attempts,
            estimate_attempts = state.estimate_attempts,
            "Reasoning loop finished"
        );

        Ok(LoopOutcome {
            resolution,
            primary,
            alternatives,
            sources: state.sources,
            transcript: state.transcript,
            direct_attempts: state.direct_attempts,
            verify_attempts: state.verify_attempts,
            estimate_attempts: state.estimate_attempts,
            usage: state.usage,
        })
    }

    async fn research(&self, task: &ReasoningTask, state: &mut LoopState) -> PipelineResult<Phase> {
        debug!(tag = %task.tag, "research: called");
        let prompt = self.render("research", &json!({"question": task.question, "context": task.context}))?;
        let request = self
            .request(task, "research", prompt.clone())?
            .with_tools(vec![Tool::WebSearch])
            .with_schema("answer", answer_schema())
            .with_mode(ResearchMode::Deep);
        let response = self.call(state, Phase::Research, request).await?;

        match parse_answer(&response.text) {
            Ok(Answer::Found { candidates }) if !response.grounding_sources.is_empty() => {
                state.candidates = candidates;
                state.sources = response.grounding_sources;
                Ok(Phase::Verify)
            }
            other => {
                // a miss here falls through without touching the retry budget
                debug!(result = ?other.map(|a| a.is_no_result()), "research: no grounded answer");
                Ok(Phase::Direct)
            }
        }
    }

    async fn direct(&self, task: &ReasoningTask, state: &mut LoopState, phase: Phase) -> PipelineResult<Phase> {
        state.direct_attempts += 1;
        let retry = phase == Phase::Retry;
        debug!(tag = %task.tag, attempt = state.direct_attempts, retry, "direct: called");

        let prompt = self.render(
            "direct",
            &json!({
                "question": task.question,
                "context": task.context,
                "retry": retry,
                "attempt": state.direct_attempts,
                "feedback": state.feedback.take(),
            }),
        )?;
        let prior = if retry { state.last_exchange.clone() } else { Vec::new() };
        let request = self
            .request(task, "direct", prompt.clone())?
            .with_tools(vec![Tool::WebSearch])
            .with_schema("answer", answer_schema())
            .with_prior_turns(prior);
        let response = self.call(state, phase, request).await?;
        state.last_exchange = vec![Turn::user(prompt), Turn::assistant(response.text.clone())];

        match parse_answer(&response.text) {
            Ok(Answer::Found { candidates }) if !response.grounding_sources.is_empty() => {
                state.candidates = candidates;
                state.sources = response.grounding_sources;
                Ok(Phase::Verify)
            }
            Ok(Answer::Found { .. }) => {
                debug!("direct: answer carries no grounding sources");
                Ok(state.retry_or_fallback())
            }
            Ok(Answer::NoResult { reason }) => {
                debug!(%reason, "direct: no result");
                Ok(state.retry_or_fallback())
            }
            Err(e) => {
                warn!(tag = %task.tag, error = %e, "Unparseable answer, counting as a retry");
                Ok(state.retry_or_fallback())
            }
        }
    }

    async fn verify(&self, task: &ReasoningTask, state: &mut LoopState) -> PipelineResult<Phase> {
        debug!(tag = %task.tag, candidates = state.candidates.len(), "verify: called");
        let prompt = self.render(
            "verify",
            &json!({
                "question": task.question,
                "candidates": state.candidates,
                "sources": state.sources,
            }),
        )?;

        let mut verdict = Verdict::default();
        for attempt in 1..=self.config.max_verify_attempts.max(1) {
            state.verify_attempts += 1;
            let request = self
                .request(task, "verify", prompt.clone())?
                .with_tools(vec![Tool::WebSearch])
                .with_schema("verdict", verdict_schema());
            let response = self.call(state, Phase::Verify, request).await?;
            match parse_verdict(&response.text) {
                Ok(parsed) => {
                    verdict = parsed;
                    break;
                }
                Err(e) => warn!(attempt, error = %e, "Unparseable verdict"),
            }
        }

        let threshold = self.config.evidence_threshold;
        let ranked: Vec<RankedCandidate> = verdict
            .rank(&state.candidates)
            .into_iter()
            .map(|(candidate, tier)| RankedCandidate {
                candidate,
                tier: Some(tier),
            })
            .collect();

        if verdict.passes(&state.candidates, threshold) {
            debug!("verify: passed");
            state.promote = ranked;
            state.resolution = Some(Resolution::Verified);
            return Ok(Phase::FilterPromote);
        }

        let qualifying: Vec<RankedCandidate> = ranked
            .into_iter()
            .filter(|r| r.tier.is_some_and(|t| t.meets(threshold)))
            .collect();
        debug!(qualifying = qualifying.len(), "verify: failed threshold");
        if !qualifying.is_empty() {
            state.partial = qualifying;
        }
        state.feedback = Some(verdict.feedback(&state.candidates, threshold));
        Ok(state.retry_or_fallback())
    }

    async fn estimate(&self, task: &ReasoningTask, state: &mut LoopState) -> PipelineResult<Phase> {
        debug!(tag = %task.tag, "estimate: called");
        state.estimate_attempts += 1;
        let prompt = self.render("estimate", &json!({"question": task.question, "context": task.context}))?;
        let request = self
            .request(task, "estimate", prompt)?
            .with_schema("answer", answer_schema());
        let response = self.call(state, Phase::Estimate, request).await?;

        match parse_answer(&response.text) {
            Ok(Answer::Found { mut candidates }) => {
                candidates.sort_by(|a, b| {
                    b.confidence_pct
                        .unwrap_or(0.0)
                        .total_cmp(&a.confidence_pct.unwrap_or(0.0))
                });
                state.promote = candidates
                    .into_iter()
                    .map(|candidate| RankedCandidate { candidate, tier: None })
                    .collect();
                state.sources = response.grounding_sources;
                state.resolution = Some(Resolution::Estimated);
                Ok(Phase::FilterPromote)
            }
            Ok(Answer::NoResult { reason }) => {
                info!(tag = %task.tag, %reason, "Estimate found nothing, giving up");
                Ok(Phase::Failed)
            }
            Err(e) => {
                warn!(tag = %task.tag, error = %e, "Unparseable estimate, giving up");
                Ok(Phase::Failed)
            }
        }
    }

    fn render(&self, name: &str, context: &serde_json::Value) -> PipelineResult<String> {
        self.prompts
            .render(name, context)
            .map_err(|e| PipelineError::Internal(e.to_string()))
    }

    fn request(&self, task: &ReasoningTask, step: &str, prompt: String) -> PipelineResult<CompletionRequest> {
        let system = self.prompts.system().map_err(|e| PipelineError::Internal(e.to_string()))?;
        Ok(CompletionRequest::new(format!("{}:{}", task.tag, step), system, prompt).with_max_tokens(self.config.max_tokens))
    }

    async fn call(&self, state: &mut LoopState, phase: Phase, request: CompletionRequest) -> PipelineResult<CompletionResponse> {
        let prompt = request.prompt.clone();
        let response = execute_with_retry(
            || {
                let request = request.clone();
                async move { self.llm.complete(request).await }
            },
            &self.retry,
            &self.classifier,
        )
        .await?;
        state.usage.add(response.usage);
        state.transcript.push(TranscriptEntry {
            phase,
            prompt,
            response: response.text.clone(),
        });
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::llm::client::mock::MockLlmClient;

    const NO_RESULT: &str = r#"{"outcome":"no_result","candidates":[],"reason":"nothing found"}"#;

    fn found(labels: &[&str]) -> String {
        let candidates: Vec<Candidate> = labels.iter().map(|l| Candidate::new(*l)).collect();
        json!({"outcome": "found", "candidates": candidates, "reason": null}).to_string()
    }

    fn verdict(ratings: &[(&str, &str)]) -> String {
        let ratings: Vec<_> = ratings
            .iter()
            .map(|(label, tier)| json!({"label": label, "tier": tier, "note": null}))
            .collect();
        json!({ "ratings": ratings }).to_string()
    }

    fn controller(mock: Arc<MockLlmClient>, config: ReasoningConfig) -> ReasoningController {
        ReasoningController::new(mock, Arc::new(PromptLoader::embedded_only()), config)
            .with_retry_policy(RetryPolicy::immediate(3))
    }

    fn task() -> ReasoningTask {
        ReasoningTask::new("supplier_finder", "Who makes the housing?", "Desk lamp, aluminium housing")
    }

    fn step(tag: &str) -> &str {
        tag.rsplit(':').next().unwrap_or(tag)
    }

    #[tokio::test]
    async fn test_always_no_result_terminates() {
        let mock = Arc::new(MockLlmClient::from_fn(|_, _| Ok(CompletionResponse::text(NO_RESULT))));
        let outcome = controller(mock.clone(), ReasoningConfig::default()).run(&task()).await.unwrap();

        assert_eq!(outcome.resolution, Resolution::Failed);
        assert!(outcome.primary.is_none());
        assert_eq!(outcome.direct_attempts, 6);
        assert_eq!(outcome.estimate_attempts, 1);
        assert_eq!(mock.call_count(), 7);
        let tags = mock.tags();
        assert_eq!(tags.iter().filter(|t| step(t) == "direct").count(), 6);
        assert_eq!(tags.last().map(|t| step(t)), Some("estimate"));
    }

    #[tokio::test]
    async fn test_verified_promotes_best() {
        let mock = Arc::new(MockLlmClient::new(vec![
            CompletionResponse::text(found(&["Acme", "Globex"])).with_sources(["https://acme.example"]),
            CompletionResponse::text(verdict(&[("Acme", "strong_inference"), ("Globex", "direct_proof")])),
        ]));
        let outcome = controller(mock.clone(), ReasoningConfig::default()).run(&task()).await.unwrap();

        assert_eq!(outcome.resolution, Resolution::Verified);
        let primary = outcome.primary.unwrap();
        assert_eq!(primary.candidate.label, "Globex");
        assert_eq!(primary.tier, Some(EvidenceTier::DirectProof));
        assert_eq!(outcome.alternatives.len(), 1);
        assert_eq!(outcome.alternatives[0].candidate.label, "Acme");
        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(outcome.transcript.len(), 2);
    }

    #[tokio::test]
    async fn test_ungrounded_answer_retries() {
        let mock = Arc::new(MockLlmClient::new(vec![
            CompletionResponse::text(found(&["Acme"])),
            CompletionResponse::text(found(&["Acme"])).with_sources(["https://acme.example"]),
            CompletionResponse::text(verdict(&[("Acme", "direct_proof")])),
        ]));
        let outcome = controller(mock.clone(), ReasoningConfig::default()).run(&task()).await.unwrap();

        assert_eq!(outcome.resolution, Resolution::Verified);
        assert_eq!(outcome.direct_attempts, 2);
        let requests = mock.requests();
        // the retry carries the previous exchange and the stronger directive
        assert_eq!(requests[1].prior_turns.len(), 2);
        assert!(requests[1].prompt.contains("Attempt 2"));
    }

    #[tokio::test]
    async fn test_failed_verification_feeds_back_then_partial() {
        let config = ReasoningConfig {
            max_retries: 1,
            ..Default::default()
        };
        let grounded = || CompletionResponse::text(found(&["Acme", "Globex"])).with_sources(["https://a.example"]);
        let mock = Arc::new(MockLlmClient::new(vec![
            grounded(),
            CompletionResponse::text(verdict(&[("Acme", "weak"), ("Globex", "strong_inference")])),
            grounded(),
            CompletionResponse::text(verdict(&[("Acme", "probable"), ("Globex", "direct_proof")])),
        ]));
        let outcome = controller(mock.clone(), config).run(&task()).await.unwrap();

        assert_eq!(outcome.resolution, Resolution::PartiallyVerified);
        assert_eq!(outcome.primary.unwrap().candidate.label, "Globex");
        assert!(outcome.alternatives.is_empty());
        assert_eq!(outcome.estimate_attempts, 0);
        let requests = mock.requests();
        assert!(requests[2].prompt.contains("Acme: weak"));
    }

    #[tokio::test]
    async fn test_nothing_qualifies_falls_back_to_estimate() {
        let config = ReasoningConfig {
            max_retries: 0,
            ..Default::default()
        };
        let mock = Arc::new(MockLlmClient::from_fn(|_, request| {
            let text = match step(&request.tag) {
                "direct" => return Ok(CompletionResponse::text(found(&["Acme"])).with_sources(["https://a.example"])),
                "verify" => verdict(&[("Acme", "weak")]),
                _ => json!({
                    "outcome": "found",
                    "candidates": [
                        {"label": "Low", "confidence_pct": 30.0},
                        {"label": "High", "confidence_pct": 70.0}
                    ],
                    "reason": null
                })
                .to_string(),
            };
            Ok(CompletionResponse::text(text))
        }));
        let outcome = controller(mock, config).run(&task()).await.unwrap();

        assert_eq!(outcome.resolution, Resolution::Estimated);
        let primary = outcome.primary.unwrap();
        assert_eq!(primary.candidate.label, "High");
        assert_eq!(primary.tier, None);
        assert_eq!(outcome.alternatives.len(), 1);
        assert_eq!(outcome.estimate_attempts, 1);
    }

    #[tokio::test]
    async fn test_parse_errors_consume_retries() {
        let config = ReasoningConfig {
            max_retries: 2,
            ..Default::default()
        };
        let mock = Arc::new(MockLlmClient::from_fn(|_, request| match step(&request.tag) {
            "estimate" => Ok(CompletionResponse::text(NO_RESULT)),
            _ => Ok(CompletionResponse::text("The supplier is probably Acme.")),
        }));
        let outcome = controller(mock.clone(), config).run(&task()).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Failed);
        assert_eq!(outcome.direct_attempts, 3);
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_unparseable_verdict_gets_second_call() {
        let mock = Arc::new(MockLlmClient::new(vec![
            CompletionResponse::text(found(&["Acme"])).with_sources(["https://a.example"]),
            CompletionResponse::text("looks fine to me"),
            CompletionResponse::text(verdict(&[("Acme", "direct_proof")])),
        ]));
        let outcome = controller(mock, ReasoningConfig::default()).run(&task()).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Verified);
        assert_eq!(outcome.verify_attempts, 2);
    }

    #[tokio::test]
    async fn test_deep_research_skips_to_verify() {
        let config = ReasoningConfig {
            deep_research: true,
            ..Default::default()
        };
        let mock = Arc::new(MockLlmClient::new(vec![
            CompletionResponse::text(found(&["Acme"])).with_sources(["https://a.example"]),
            CompletionResponse::text(verdict(&[("Acme", "direct_proof")])),
        ]));
        let outcome = controller(mock.clone(), config).run(&task()).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Verified);
        assert_eq!(outcome.direct_attempts, 0);
        let requests = mock.requests();
        assert_eq!(requests[0].mode, ResearchMode::Deep);
        assert_eq!(step(&requests[0].tag), "research");
    }

    #[tokio::test]
    async fn test_deep_research_miss_keeps_retry_budget() {
        let config = ReasoningConfig {
            deep_research: true,
            max_retries: 1,
            ..Default::default()
        };
        let mock = Arc::new(MockLlmClient::from_fn(|_, _| Ok(CompletionResponse::text(NO_RESULT))));
        let outcome = controller(mock.clone(), config).run(&task()).await.unwrap();
        assert_eq!(outcome.resolution, Resolution::Failed);
        assert_eq!(outcome.direct_attempts, 2);
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_service_outage_surfaces_as_exhausted() {
        let mock = Arc::new(MockLlmClient::from_fn(|_, _| {
            Err(LlmError::ApiError {
                status: 503,
                message: "overloaded".into(),
            })
        }));
        let err = controller(mock.clone(), ReasoningConfig::default())
            .run(&task())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Exhausted { attempts: 3, .. }));
        assert_eq!(mock.call_count(), 3);
    }
}
