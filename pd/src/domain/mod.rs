//! Domain types for the calculation graph

mod artifact;
mod entity;
mod id;
mod lifecycle;
mod stage;

pub use artifact::{Artifact, ArtifactKind};
pub use entity::{ChainLink, Entity, EntityKind, StageOutput, fields};
pub use id::{generate_id, slugify};
pub use lifecycle::{Lifecycle, StageStatus, TransitionError};
pub use stage::StageName;
