//! Batched writes with optimistic preconditions

use crate::document::{DocRef, Fields};

/// A single write inside a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Create or replace the whole document
    Set { reference: DocRef, fields: Fields },
    /// Create a document that must not exist yet
    Create { reference: DocRef, fields: Fields },
    /// Merge fields (dotted paths allowed) into an existing document
    Update { reference: DocRef, fields: Fields },
    /// Atomically add to a numeric field of an existing document
    Increment { reference: DocRef, field: String, by: f64 },
    Delete { reference: DocRef },
}

impl Write {
    pub fn reference(&self) -> &DocRef {
        match self {
            Write::Set { reference, .. }
            | Write::Create { reference, .. }
            | Write::Update { reference, .. }
            | Write::Increment { reference, .. }
            | Write::Delete { reference } => reference,
        }
    }
}

/// Expected state of a document at commit time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub reference: DocRef,
    /// `None` means the document must not exist
    pub version: Option<u64>,
}

/// An all-or-nothing group of writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub preconditions: Vec<Precondition>,
    pub writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn expect_version(&mut self, reference: DocRef, version: Option<u64>) -> &mut Self {
        self.preconditions.push(Precondition { reference, version });
        self
    }

    pub fn set(&mut self, reference: DocRef, fields: Fields) -> &mut Self {
        self.writes.push(Write::Set { reference, fields });
        self
    }

    pub fn create(&mut self, reference: DocRef, fields: Fields) -> &mut Self {
        self.writes.push(Write::Create { reference, fields });
        self
    }

    pub fn update(&mut self, reference: DocRef, fields: Fields) -> &mut Self {
        self.writes.push(Write::Update { reference, fields });
        self
    }

    pub fn increment(&mut self, reference: DocRef, field: impl Into<String>, by: f64) -> &mut Self {
        self.writes.push(Write::Increment {
            reference,
            field: field.into(),
            by,
        });
        self
    }

    pub fn delete(&mut self, reference: DocRef) -> &mut Self {
        self.writes.push(Write::Delete { reference });
        self
    }
}
