//! Embedded prompts
//!
//! These are compiled into the binary from the .pmt files under `prompts/`.

use tracing::debug;

pub const SYSTEM: &str = include_str!("../../prompts/system.pmt");
pub const RESEARCH: &str = include_str!("../../prompts/research.pmt");
pub const DIRECT: &str = include_str!("../../prompts/direct.pmt");
pub const VERIFY: &str = include_str!("../../prompts/verify.pmt");
pub const ESTIMATE: &str = include_str!("../../prompts/estimate.pmt");
pub const BOM: &str = include_str!("../../prompts/bom.pmt");
pub const FOOTPRINT: &str = include_str!("../../prompts/footprint.pmt");
pub const REVIEW: &str = include_str!("../../prompts/review.pmt");
pub const UNCERTAINTY: &str = include_str!("../../prompts/uncertainty.pmt");

/// Get the embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "system" => Some(SYSTEM),
        "research" => Some(RESEARCH),
        "direct" => Some(DIRECT),
        "verify" => Some(VERIFY),
        "estimate" => Some(ESTIMATE),
        "bom" => Some(BOM),
        "footprint" => Some(FOOTPRINT),
        "review" => Some(REVIEW),
        "uncertainty" => Some(UNCERTAINTY),
        _ => {
            debug!("get_embedded: no match found");
            None
        }
    }
}
