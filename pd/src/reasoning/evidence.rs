//! Evidence tiers and verification verdicts

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::answer::{Candidate, ParseError, parse_json};

/// Ordinal rating of how well an answer is supported by retrieved sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceTier {
    #[default]
    NoEvidence,
    Weak,
    Probable,
    StrongInference,
    DirectProof,
}

impl EvidenceTier {
    pub const ALL: [EvidenceTier; 5] = [
        EvidenceTier::NoEvidence,
        EvidenceTier::Weak,
        EvidenceTier::Probable,
        EvidenceTier::StrongInference,
        EvidenceTier::DirectProof,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceTier::NoEvidence => "no_evidence",
            EvidenceTier::Weak => "weak",
            EvidenceTier::Probable => "probable",
            EvidenceTier::StrongInference => "strong_inference",
            EvidenceTier::DirectProof => "direct_proof",
        }
    }

    pub fn meets(&self, threshold: EvidenceTier) -> bool {
        *self >= threshold
    }
}

impl std::fmt::Display for EvidenceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The verifier's rating of one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub label: String,
    pub tier: EvidenceTier,
    #[serde(default)]
    pub note: Option<String>,
}

/// A full verification pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub ratings: Vec<Rating>,
}

impl Verdict {
    /// Tier given to a candidate; unrated candidates have no evidence
    pub fn tier_of(&self, candidate: &Candidate) -> EvidenceTier {
        let label = candidate.label.trim();
        self.ratings
            .iter()
            .filter(|r| r.label.trim().eq_ignore_ascii_case(label))
            .map(|r| r.tier)
            .max()
            .unwrap_or_default()
    }

    /// Pair every candidate with its tier, best first. Ties keep input order.
    pub fn rank(&self, candidates: &[Candidate]) -> Vec<(Candidate, EvidenceTier)> {
        let mut ranked: Vec<(Candidate, EvidenceTier)> =
            candidates.iter().map(|c| (c.clone(), self.tier_of(c))).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    /// True when no candidate falls below `threshold`
    pub fn passes(&self, candidates: &[Candidate], threshold: EvidenceTier) -> bool {
        candidates.iter().all(|c| self.tier_of(c).meets(threshold))
    }

    /// Notes on candidates below `threshold`, for feeding back into the next attempt
    pub fn feedback(&self, candidates: &[Candidate], threshold: EvidenceTier) -> String {
        candidates
            .iter()
            .filter(|c| !self.tier_of(c).meets(threshold))
            .map(|c| {
                let note = self
                    .ratings
                    .iter()
                    .find(|r| r.label.trim().eq_ignore_ascii_case(c.label.trim()))
                    .and_then(|r| r.note.clone())
                    .unwrap_or_else(|| "not supported by any retrieved source".to_string());
                format!("- {}: {} ({})", c.label, self.tier_of(c), note)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Decode a reply to a [`verdict_schema`] request
pub fn parse_verdict(text: &str) -> Result<Verdict, ParseError> {
    parse_json(text)
}

/// JSON schema for verdicts
pub fn verdict_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "ratings": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": {"type": "string"},
                        "tier": {
                            "type": "string",
                            "enum": EvidenceTier::ALL.iter().map(EvidenceTier::as_str).collect::<Vec<_>>()
                        },
                        "note": {"type": ["string", "null"]}
                    },
                    "required": ["label", "tier", "note"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["ratings"],
        "additionalProperties": false
    })
}
