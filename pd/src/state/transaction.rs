//! Optimistic multi-document transactions
//!
//! Reads record the version they saw; commit turns those into preconditions
//! so the buffered writes only land if nothing read has changed since.

use std::collections::HashMap;

use entitystore::{DocRef, Document, Fields, WriteBatch};
use tracing::debug;

use super::{StateError, StateManager, StateResponse};

pub struct Transaction {
    state: StateManager,
    reads: HashMap<DocRef, Option<u64>>,
    batch: WriteBatch,
}

impl Transaction {
    pub fn begin(state: &StateManager) -> Self {
        Self {
            state: state.clone(),
            reads: HashMap::new(),
            batch: WriteBatch::new(),
        }
    }

    /// Read a document and pin its version
    pub async fn get(&mut self, reference: &DocRef) -> StateResponse<Option<Document>> {
        let doc = self.state.get(reference).await?;
        let version = doc.as_ref().map(|d| d.version);
        match self.reads.get(reference) {
            Some(seen) if *seen != version => {
                debug!(%reference, ?seen, ?version, "Transaction::get: changed since first read");
                return Err(StateError::Conflict(reference.to_string()));
            }
            Some(_) => {}
            None => {
                self.reads.insert(reference.clone(), version);
            }
        }
        Ok(doc)
    }

    pub async fn get_required(&mut self, reference: &DocRef) -> StateResponse<Document> {
        self.get(reference)
            .await?
            .ok_or_else(|| StateError::NotFound(reference.to_string()))
    }

    pub fn create(&mut self, reference: DocRef, fields: Fields) -> &mut Self {
        self.batch.create(reference, fields);
        self
    }

    pub fn update(&mut self, reference: DocRef, fields: Fields) -> &mut Self {
        self.batch.update(reference, fields);
        self
    }

    pub fn increment(&mut self, reference: DocRef, field: &str, by: f64) -> &mut Self {
        self.batch.increment(reference, field, by);
        self
    }

    pub fn write_count(&self) -> usize {
        self.batch.len()
    }

    /// Commit buffered writes. Fails with [`StateError::Conflict`] if any read document moved.
    pub async fn commit(self) -> StateResponse<()> {
        debug!(reads = self.reads.len(), writes = self.batch.len(), "Transaction::commit: called");
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut batch = self.batch;
        for (reference, version) in self.reads {
            batch.expect_version(reference, version);
        }
        self.state.commit(batch).await
    }
}
