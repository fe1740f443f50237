//! Fixed routing table
//!
//! | completed stage     | downstream                                                         |
//! |---------------------|--------------------------------------------------------------------|
//! | expand_materials    | children: supplier_finder; self: completion_check                  |
//! | supplier_finder     | self: material_footprint, transport_footprint, footprint_review    |
//! | footprint_review    | self: uncertainty                                                  |
//! | uncertainty         | self: expand_materials if expandable, else parent: completion_check |
//! | completion_check    | parent: completion_check                                           |
//!
//! Parent completion checks are only triggered by the child that finished last.

use crate::domain::{Entity, StageName};
use crate::queue::{Dedupe, TaskSpec};

/// Completion checks wait behind regular work
const COMPLETION_PRIORITY: i32 = -1;

/// Everything the table looks at, read after the stage committed
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub stage: StageName,
    pub entity: &'a Entity,
    pub parent: Option<&'a Entity>,
    pub children: &'a [Entity],
    pub max_tier: u32,
}

/// Downstream tasks for a completed stage
pub fn route(input: RouteInput<'_>) -> Vec<TaskSpec> {
    let entity = input.entity;
    match input.stage {
        StageName::ExpandMaterials => {
            let mut specs: Vec<TaskSpec> = input
                .children
                .iter()
                .map(|child| once(StageName::SupplierFinder, &child.id))
                .collect();
            specs.push(completion_check(&entity.id));
            specs
        }
        StageName::SupplierFinder => vec![
            once(StageName::MaterialFootprint, &entity.id),
            once(StageName::TransportFootprint, &entity.id),
            once(StageName::FootprintReview, &entity.id).after(0).after(1),
        ],
        StageName::MaterialFootprint | StageName::TransportFootprint => Vec::new(),
        StageName::FootprintReview => vec![once(StageName::Uncertainty, &entity.id)],
        StageName::Uncertainty if entity.is_expandable(input.max_tier) => {
            vec![once(StageName::ExpandMaterials, &entity.id)]
        }
        StageName::Uncertainty | StageName::CompletionCheck => parent_check(entity, input.parent),
    }
}

/// Parent completion check, when `entity` finished and was the last child to do so
fn parent_check(entity: &Entity, parent: Option<&Entity>) -> Vec<TaskSpec> {
    match parent {
        Some(parent)
            if entity.lifecycle.is_terminal() && parent.child_count > 0 && parent.children_done >= parent.child_count =>
        {
            vec![completion_check(&parent.id)]
        }
        _ => Vec::new(),
    }
}

/// Each stage runs once per entity, so any existing task with the key is reused
fn once(stage: StageName, entity_id: &str) -> TaskSpec {
    TaskSpec::new(stage, entity_id).dedupe(Dedupe::Any)
}

fn completion_check(entity_id: &str) -> TaskSpec {
    TaskSpec::new(StageName::CompletionCheck, entity_id)
        .dedupe(Dedupe::Queued)
        .priority(COMPLETION_PRIORITY)
}
