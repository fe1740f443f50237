//! Product and material nodes

use std::collections::BTreeMap;

use entitystore::{DocRef, Document, Fields, StoreError};
use serde::{Deserialize, Serialize};

use super::{Lifecycle, StageName, StageStatus, generate_id};

/// Persisted field names used in partial updates and queries
pub mod fields {
    use super::StageName;

    pub const ESTIMATED_CF: &str = "estimated_cf";
    pub const CF_FULL: &str = "cf_full";
    pub const TRANSPORT_CF: &str = "transport_cf";
    pub const LIFECYCLE: &str = "lifecycle";
    pub const LINKED_PRODUCT: &str = "linked_product";
    pub const PARENT_MATERIAL: &str = "parent_material";
    pub const CHILD_COUNT: &str = "child_count";
    pub const CHILDREN_DONE: &str = "children_done";
    pub const COMPLETION_STARTED_AT: &str = "completion_started_at";
    pub const SUPPLIER_NAME: &str = "supplier_name";
    pub const SUPPLIER_ESTIMATED: &str = "supplier_estimated";
    pub const SUPPLIER_ALTERNATIVES: &str = "supplier_alternatives";

    pub fn stage(stage: StageName) -> String {
        format!("stages.{}", stage)
    }

    pub fn child_progress(stage: StageName) -> String {
        format!("child_progress.{}", stage)
    }
}

/// Node kind; each kind lives in its own collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Material,
}

impl EntityKind {
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Product => "products",
            Self::Material => "materials",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Product => "product",
            Self::Material => "material",
        }
    }

    pub fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            "products" => Some(Self::Product),
            "materials" => Some(Self::Material),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ancestor in a node's materialized chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainLink {
    pub document_id: String,
    pub kind: EntityKind,
    pub tier: u32,
}

impl ChainLink {
    pub fn reference(&self) -> DocRef {
        DocRef::new(self.kind.collection(), self.document_id.clone())
    }
}

/// Stage-output fields; a change in one of these drives the aggregate delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutput {
    CfFull,
    TransportCf,
}

impl StageOutput {
    pub fn field(&self) -> &'static str {
        match self {
            Self::CfFull => fields::CF_FULL,
            Self::TransportCf => fields::TRANSPORT_CF,
        }
    }
}

/// A product (root) or material (leaf or interior) node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mass_kg: Option<f64>,
    #[serde(default)]
    pub parent_material: Option<DocRef>,
    #[serde(default)]
    pub linked_product: Option<DocRef>,
    /// Ancestors root-first; fixed at creation
    #[serde(default)]
    pub pm_chain: Vec<ChainLink>,
    #[serde(default)]
    pub tier: u32,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub stages: BTreeMap<StageName, StageStatus>,
    /// Aggregate; only ever moved by deltas
    #[serde(default)]
    pub estimated_cf: f64,
    #[serde(default)]
    pub cf_full: Option<f64>,
    #[serde(default)]
    pub transport_cf: Option<f64>,
    #[serde(default)]
    pub supplier_name: Option<String>,
    #[serde(default)]
    pub supplier_estimated: bool,
    #[serde(default)]
    pub supplier_alternatives: Vec<String>,
    #[serde(default)]
    pub child_count: u64,
    #[serde(default)]
    pub children_done: u64,
    #[serde(default)]
    pub child_progress: BTreeMap<StageName, u64>,
    #[serde(default)]
    pub completion_started_at: Option<i64>,
}

impl Entity {
    fn blank(kind: EntityKind, name: &str) -> Self {
        Self {
            id: generate_id(kind.as_str(), name),
            kind,
            name: name.to_string(),
            description: None,
            mass_kg: None,
            parent_material: None,
            linked_product: None,
            pm_chain: Vec::new(),
            tier: 0,
            lifecycle: Lifecycle::Created,
            stages: BTreeMap::new(),
            estimated_cf: 0.0,
            cf_full: None,
            transport_cf: None,
            supplier_name: None,
            supplier_estimated: false,
            supplier_alternatives: Vec::new(),
            child_count: 0,
            children_done: 0,
            child_progress: BTreeMap::new(),
            completion_started_at: None,
        }
    }

    /// A root product
    pub fn product(name: &str) -> Self {
        Self::blank(EntityKind::Product, name)
    }

    /// A material under `parent`, with its ancestor chain materialized
    pub fn material_of(parent: &Entity, name: &str) -> Self {
        let mut material = Self::blank(EntityKind::Material, name);
        match parent.kind {
            EntityKind::Product => material.linked_product = Some(parent.reference()),
            EntityKind::Material => material.parent_material = Some(parent.reference()),
        }
        material.pm_chain = parent.pm_chain.clone();
        material.pm_chain.push(ChainLink {
            document_id: parent.id.clone(),
            kind: parent.kind,
            tier: parent.tier,
        });
        material.tier = parent.tier + 1;
        material
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_mass(mut self, mass_kg: f64) -> Self {
        self.mass_kg = Some(mass_kg);
        self
    }

    pub fn reference(&self) -> DocRef {
        DocRef::new(self.kind.collection(), self.id.clone())
    }

    /// Direct parent, if any
    pub fn parent(&self) -> Option<&DocRef> {
        self.parent_material.as_ref().or(self.linked_product.as_ref())
    }

    pub fn stage_status(&self, stage: StageName) -> StageStatus {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn is_stage_complete(&self, stage: StageName) -> bool {
        self.stage_status(stage).is_complete()
    }

    pub fn output(&self, output: StageOutput) -> Option<f64> {
        match output {
            StageOutput::CfFull => self.cf_full,
            StageOutput::TransportCf => self.transport_cf,
        }
    }

    /// Whether this node gets its own bill of materials
    pub fn is_expandable(&self, max_tier: u32) -> bool {
        match self.kind {
            EntityKind::Product => true,
            EntityKind::Material => self.tier < max_tier,
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self, StoreError> {
        doc.decode()
    }

    pub fn to_fields(&self) -> Result<Fields, StoreError> {
        entitystore::to_fields(self)
    }
}
