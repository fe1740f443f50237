//! Multi-round reasoning
//!
//! Structured answers, evidence tiers, and the bounded loop controller that
//! turns a fallible reasoning service into a graded answer.

mod answer;
mod controller;
mod evidence;

pub use answer::{Answer, Candidate, ParseError, answer_schema, parse_answer};
pub(crate) use answer::parse_json;
pub use controller::{
    LoopOutcome, Phase, RankedCandidate, ReasoningController, ReasoningTask, Resolution, TranscriptEntry,
};
pub use evidence::{EvidenceTier, Rating, Verdict, parse_verdict, verdict_schema};
