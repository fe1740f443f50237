//! Uncertainty combiner
//!
//! Pedigree-style quality scores are multiplicative ratios (each >= 1). They
//! are combined as a log-normal root-sum-square:
//! `U_total = exp(sqrt(sum(ln(U_i)^2) + ln(U_b)^2))`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

/// Independent quality dimension of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Precision,
    Completeness,
    Temporal,
    Geographical,
    Technological,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Precision,
        Dimension::Completeness,
        Dimension::Temporal,
        Dimension::Geographical,
        Dimension::Technological,
    ];

    /// Ratio used when no usable score was given
    pub fn default_ratio(&self) -> f64 {
        match self {
            Dimension::Precision => 1.50,
            Dimension::Completeness => 1.20,
            Dimension::Temporal => 1.50,
            Dimension::Geographical => 1.10,
            Dimension::Technological => 2.00,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Precision => "precision",
            Dimension::Completeness => "completeness",
            Dimension::Temporal => "temporal",
            Dimension::Geographical => "geographical",
            Dimension::Technological => "technological",
        }
    }
}

/// Calculation-method class; selects the baseline ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodClass {
    Transport,
    Material,
}

impl MethodClass {
    pub fn baseline(&self) -> f64 {
        match self {
            MethodClass::Transport => 2.00,
            MethodClass::Material => 1.05,
        }
    }
}

/// Raw per-dimension scores as rated; any may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityScores {
    pub precision: Option<f64>,
    pub completeness: Option<f64>,
    pub temporal: Option<f64>,
    pub geographical: Option<f64>,
    pub technological: Option<f64>,
}

impl QualityScores {
    pub fn get(&self, dimension: Dimension) -> Option<f64> {
        match dimension {
            Dimension::Precision => self.precision,
            Dimension::Completeness => self.completeness,
            Dimension::Temporal => self.temporal,
            Dimension::Geographical => self.geographical,
            Dimension::Technological => self.technological,
        }
    }

    /// Usable ratio for a dimension, falling back to its default
    pub fn ratio(&self, dimension: Dimension) -> (f64, bool) {
        match self.get(dimension) {
            Some(score) if score.is_finite() && score >= 1.0 => (score, false),
            _ => (dimension.default_ratio(), true),
        }
    }

    /// JSON schema for requesting scores in structured mode
    pub fn schema() -> Value {
        let properties: serde_json::Map<String, Value> = Dimension::ALL
            .iter()
            .map(|d| (d.as_str().to_string(), json!({"type": ["number", "null"]})))
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": Dimension::ALL.iter().map(Dimension::as_str).collect::<Vec<_>>(),
            "additionalProperties": false,
        })
    }
}

/// Everything that went into one combined uncertainty, persisted as-is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyRecord {
    pub result: f64,
    pub method: MethodClass,
    pub scores: QualityScores,
    /// Ratios actually used, defaults filled in
    pub factors: BTreeMap<Dimension, f64>,
    pub defaulted: Vec<Dimension>,
    pub baseline: f64,
    pub total_ratio: f64,
    pub lower: f64,
    pub upper: f64,
    /// Symmetric absolute uncertainty
    pub absolute: f64,
}

/// `exp(sqrt(sum(ln(f)^2) + ln(baseline)^2))`
pub fn combine(factors: &[f64], baseline: f64) -> f64 {
    let sum_of_squares: f64 = factors
        .iter()
        .chain(std::iter::once(&baseline))
        .map(|f| f.ln().powi(2))
        .sum();
    sum_of_squares.sqrt().exp()
}

/// `((R*U - R) + (R - R/U)) / 2`
pub fn absolute_uncertainty(result: f64, total_ratio: f64) -> f64 {
    let upper_delta = result * total_ratio - result;
    let lower_delta = result - result / total_ratio;
    (upper_delta + lower_delta) / 2.0
}

/// Combine scores for a result. Returns `None` when there is no finite result.
pub fn assess(result: Option<f64>, scores: &QualityScores, method: MethodClass) -> Option<UncertaintyRecord> {
    debug!(?result, ?method, "assess: called");
    let result = result.filter(|r| r.is_finite())?;

    let mut factors = BTreeMap::new();
    let mut defaulted = Vec::new();
    for dimension in Dimension::ALL {
        let (ratio, was_default) = scores.ratio(dimension);
        if was_default {
            defaulted.push(dimension);
        }
        factors.insert(dimension, ratio);
    }

    let baseline = method.baseline();
    let ratios: Vec<f64> = factors.values().copied().collect();
    let total_ratio = combine(&ratios, baseline);
    debug!(total_ratio, defaulted = defaulted.len(), "assess: combined");

    Some(UncertaintyRecord {
        result,
        method,
        scores: scores.clone(),
        factors,
        defaulted,
        baseline,
        total_ratio,
        lower: result / total_ratio,
        upper: result * total_ratio,
        absolute: absolute_uncertainty(result, total_ratio),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_all_ones_is_one() {
        assert!(close(combine(&[1.0; 5], 1.0), 1.0));
    }

    #[test]
    fn test_single_factor_passes_through() {
        assert!(close(combine(&[2.0, 1.0, 1.0, 1.0, 1.0], 1.0), 2.0));
        assert!(close(combine(&[1.0; 5], 2.0), 2.0));
    }

    #[test]
    fn test_two_factors_rss() {
        let expected = (2f64.ln().powi(2) * 2.0).sqrt().exp();
        assert!(close(combine(&[2.0], 2.0), expected));
    }

    #[test]
    fn test_missing_scores_use_defaults() {
        let record = assess(Some(10.0), &QualityScores::default(), MethodClass::Material).unwrap();
        assert_eq!(record.defaulted.len(), 5);
        assert_eq!(record.factors[&Dimension::Technological], 2.0);

        let expected = combine(&[1.5, 1.2, 1.5, 1.1, 2.0], 1.05);
        assert!(close(record.total_ratio, expected));
        assert!(record.total_ratio > 1.0);
    }

    #[test]
    fn test_invalid_scores_count_as_missing() {
        let scores = QualityScores {
            precision: Some(0.5),
            completeness: Some(f64::NAN),
            temporal: Some(1.0),
            ..Default::default()
        };
        assert_eq!(scores.ratio(Dimension::Precision), (1.5, true));
        assert_eq!(scores.ratio(Dimension::Completeness), (1.2, true));
        assert_eq!(scores.ratio(Dimension::Temporal), (1.0, false));
    }

    #[test]
    fn test_absolute_uncertainty() {
        // R=10, U=2: upper 20, lower 5, deltas 10 and 5
        assert!(close(absolute_uncertainty(10.0, 2.0), 7.5));
        assert!(close(absolute_uncertainty(10.0, 1.0), 0.0));
    }

    #[test]
    fn test_no_result_no_record() {
        assert!(assess(None, &QualityScores::default(), MethodClass::Transport).is_none());
        assert!(assess(Some(f64::INFINITY), &QualityScores::default(), MethodClass::Transport).is_none());
    }

    #[test]
    fn test_bounds() {
        let scores = QualityScores {
            precision: Some(1.0),
            completeness: Some(1.0),
            temporal: Some(1.0),
            geographical: Some(1.0),
            technological: Some(1.0),
        };
        let record = assess(Some(8.0), &scores, MethodClass::Transport).unwrap();
        assert!(record.defaulted.is_empty());
        assert!(close(record.total_ratio, 2.0));
        assert!(close(record.lower, 4.0));
        assert!(close(record.upper, 16.0));
        assert!(close(record.absolute, 6.0));
    }
}
