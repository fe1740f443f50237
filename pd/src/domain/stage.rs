//! Stage names

use serde::{Deserialize, Serialize};

/// One idempotency-guarded unit of pipeline work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    ExpandMaterials,
    SupplierFinder,
    MaterialFootprint,
    TransportFootprint,
    FootprintReview,
    Uncertainty,
    CompletionCheck,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::ExpandMaterials,
        StageName::SupplierFinder,
        StageName::MaterialFootprint,
        StageName::TransportFootprint,
        StageName::FootprintReview,
        StageName::Uncertainty,
        StageName::CompletionCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpandMaterials => "expand_materials",
            Self::SupplierFinder => "supplier_finder",
            Self::MaterialFootprint => "material_footprint",
            Self::TransportFootprint => "transport_footprint",
            Self::FootprintReview => "footprint_review",
            Self::Uncertainty => "uncertainty",
            Self::CompletionCheck => "completion_check",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("Unknown stage: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
            assert_eq!(serde_json::to_value(stage).unwrap(), serde_json::json!(stage.as_str()));
        }
        assert!("cf99".parse::<StageName>().is_err());
    }
}
