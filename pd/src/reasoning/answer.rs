//! Structured answers from the reasoning service
//!
//! Answers are requested in strict JSON-schema mode. Anything that does not
//! decode against that shape is a [`ParseError`], which is a different thing
//! from the service saying it found nothing ([`Answer::NoResult`]).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// The service reply did not match the requested structure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty response")]
    Empty,

    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("unexpected structure: {0}")]
    Structure(String),
}

/// One proposed answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub label: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Self-reported confidence, 0-100; only estimates are required to carry one
    #[serde(default)]
    pub confidence_pct: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl Candidate {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: None,
            unit: None,
            confidence_pct: None,
            rationale: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }
}

/// Decoded answer
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    Found { candidates: Vec<Candidate> },
    NoResult { reason: String },
}

impl Answer {
    pub fn is_no_result(&self) -> bool {
        matches!(self, Answer::NoResult { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Found,
    NoResult,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    outcome: Outcome,
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    reason: Option<String>,
}

/// Strip a surrounding markdown code fence, if any
pub(crate) fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Decode a JSON value out of a reply
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let body = strip_fences(text);
    if body.is_empty() {
        return Err(ParseError::Empty);
    }
    let value: Value = serde_json::from_str(body).map_err(|e| ParseError::Json(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| ParseError::Structure(e.to_string()))
}

/// Decode a reply to an [`answer_schema`] request
pub fn parse_answer(text: &str) -> Result<Answer, ParseError> {
    let raw: RawAnswer = parse_json(text)?;
    match raw.outcome {
        Outcome::NoResult => Ok(Answer::NoResult {
            reason: raw.reason.unwrap_or_default(),
        }),
        Outcome::Found => {
            let candidates: Vec<Candidate> = raw
                .candidates
                .into_iter()
                .filter(|c| !c.label.trim().is_empty())
                .collect();
            if candidates.is_empty() {
                Ok(Answer::NoResult {
                    reason: "found without candidates".to_string(),
                })
            } else {
                Ok(Answer::Found { candidates })
            }
        }
    }
}

/// JSON schema for answers
pub fn answer_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "outcome": {"type": "string", "enum": ["found", "no_result"]},
            "candidates": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": {"type": "string"},
                        "value": {"type": ["number", "null"]},
                        "unit": {"type": ["string", "null"]},
                        "confidence_pct": {"type": ["number", "null"]},
                        "rationale": {"type": ["string", "null"]}
                    },
                    "required": ["label", "value", "unit", "confidence_pct", "rationale"],
                    "additionalProperties": false
                }
            },
            "reason": {"type": ["string", "null"]}
        },
        "required": ["outcome", "candidates", "reason"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_found() {
        let text = r#"{"outcome":"found","candidates":[{"label":"Acme Metals","value":null,"unit":null,"confidence_pct":null,"rationale":"listed on site"}],"reason":null}"#;
        match parse_answer(text).unwrap() {
            Answer::Found { candidates } => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].label, "Acme Metals");
                assert_eq!(candidates[0].rationale.as_deref(), Some("listed on site"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_no_result() {
        let answer = parse_answer(r#"{"outcome":"no_result","candidates":[],"reason":"nothing public"}"#).unwrap();
        assert_eq!(
            answer,
            Answer::NoResult {
                reason: "nothing public".into()
            }
        );
    }

    #[test]
    fn test_found_without_candidates_is_no_result() {
        assert!(parse_answer(r#"{"outcome":"found","candidates":[{"label":"  "}]}"#).unwrap().is_no_result());
    }

    #[test]
    fn test_code_fence_stripped() {
        let text = "```json\n{\"outcome\":\"no_result\"}\n```";
        assert!(parse_answer(text).unwrap().is_no_result());
    }

    #[test]
    fn test_parse_errors_are_distinct() {
        assert_eq!(parse_answer("   "), Err(ParseError::Empty));
        assert!(matches!(parse_answer("Supplier: Acme"), Err(ParseError::Json(_))));
        assert!(matches!(parse_answer(r#"{"outcome":"maybe"}"#), Err(ParseError::Structure(_))));
    }
}
