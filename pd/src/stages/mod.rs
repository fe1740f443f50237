//! Stage handlers
//!
//! One handler per [`StageName`]. Handlers read the entity, talk to the
//! reasoning service and describe their writes as a [`StageCommit`]; the
//! dispatcher commits them.
//!
//! [`StageCommit`]: crate::propagation::StageCommit

use std::sync::Arc;

use serde_json::{Value, json};

use crate::dispatch::StageHandler;
use crate::domain::{Entity, StageName};

mod completion_check;
mod expand_materials;
mod footprint;
mod footprint_review;
mod supplier_finder;
mod uncertainty;

pub use completion_check::CompletionCheck;
pub use expand_materials::{Bom, BomItem, ExpandMaterials};
pub use footprint::{FootprintAnswer, FootprintLeg, MaterialFootprint, TransportFootprint};
pub use footprint_review::{FootprintReview, ReviewAnswer};
pub use supplier_finder::SupplierFinder;
pub use uncertainty::Uncertainty;

/// Handlers for every stage
pub fn all() -> Vec<Arc<dyn StageHandler>> {
    let handlers: Vec<Arc<dyn StageHandler>> = vec![
        Arc::new(ExpandMaterials),
        Arc::new(SupplierFinder),
        Arc::new(MaterialFootprint),
        Arc::new(TransportFootprint),
        Arc::new(FootprintReview),
        Arc::new(Uncertainty),
        Arc::new(CompletionCheck),
    ];
    debug_assert_eq!(handlers.len(), StageName::ALL.len());
    handlers
}

/// Template context describing an entity
fn describe(entity: &Entity) -> Value {
    json!({
        "name": entity.name,
        "description": entity.description,
        "mass_kg": entity.mass_kg,
        "supplier": entity.supplier_name,
    })
}

/// Request tag for a stage on an entity
fn tag(stage: StageName, entity: &Entity) -> String {
    format!("{}:{}", stage, entity.id)
}
