//! StateManager - actor that owns the entity store
//!
//! Processes commands via channels for shared access to persistent state.

use std::path::Path;

use entitystore::{DocRef, Document, Fields, Filter, Order, Query, Store, WriteBatch};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::messages::{StateCommand, StateError, StateResponse};
use crate::domain::{Artifact, Entity, EntityKind, fields};

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a new StateManager actor over the store in `store_dir`
    pub fn spawn(store_dir: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_dir = %store_dir.as_ref().display(), "spawn: called");
        let store = Store::open(store_dir.as_ref())?;
        Ok(Self::start(store))
    }

    /// Spawn a StateManager over a throwaway in-memory store
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        debug!("spawn_in_memory: called");
        Ok(Self::start(Store::open_in_memory()?))
    }

    fn start(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Document operations ===

    pub async fn get(&self, reference: &DocRef) -> StateResponse<Option<Document>> {
        debug!(%reference, "get: called");
        let reference = reference.clone();
        self.request(|reply| StateCommand::Get { reference, reply }).await
    }

    /// Get a document, returning error if not found
    pub async fn get_required(&self, reference: &DocRef) -> StateResponse<Document> {
        debug!(%reference, "get_required: called");
        self.get(reference)
            .await?
            .ok_or_else(|| StateError::NotFound(reference.to_string()))
    }

    pub async fn query(&self, query: Query) -> StateResponse<Vec<Document>> {
        debug!(collection = %query.collection, "query: called");
        self.request(|reply| StateCommand::Query { query, reply }).await
    }

    /// Apply a batch atomically
    pub async fn commit(&self, batch: WriteBatch) -> StateResponse<()> {
        debug!(writes = batch.len(), "commit: called");
        if batch.is_empty() {
            debug!("commit: empty batch");
            return Ok(());
        }
        self.request(|reply| StateCommand::Commit { batch, reply }).await
    }

    pub async fn collections(&self) -> StateResponse<Vec<(String, usize)>> {
        debug!("collections: called");
        self.request(|reply| StateCommand::Collections { reply }).await
    }

    pub async fn create(&self, reference: DocRef, fields: Fields) -> StateResponse<()> {
        debug!(%reference, "create: called");
        let mut batch = WriteBatch::new();
        batch.create(reference, fields);
        self.commit(batch).await
    }

    pub async fn set(&self, reference: DocRef, fields: Fields) -> StateResponse<()> {
        debug!(%reference, "set: called");
        let mut batch = WriteBatch::new();
        batch.set(reference, fields);
        self.commit(batch).await
    }

    /// Merge fields (dotted paths allowed) into an existing document
    pub async fn update(&self, reference: DocRef, fields: Fields) -> StateResponse<()> {
        debug!(%reference, "update: called");
        let mut batch = WriteBatch::new();
        batch.update(reference, fields);
        self.commit(batch).await
    }

    pub async fn increment(&self, reference: DocRef, field: &str, by: f64) -> StateResponse<()> {
        debug!(%reference, %field, %by, "increment: called");
        let mut batch = WriteBatch::new();
        batch.increment(reference, field, by);
        self.commit(batch).await
    }

    pub async fn delete(&self, reference: DocRef) -> StateResponse<()> {
        debug!(%reference, "delete: called");
        let mut batch = WriteBatch::new();
        batch.delete(reference);
        self.commit(batch).await
    }

    // === Entity operations ===

    pub async fn create_entity(&self, entity: &Entity) -> StateResponse<DocRef> {
        debug!(entity_id = %entity.id, kind = %entity.kind, "create_entity: called");
        let reference = entity.reference();
        self.create(reference.clone(), entity.to_fields()?).await?;
        Ok(reference)
    }

    pub async fn get_entity(&self, reference: &DocRef) -> StateResponse<Option<Entity>> {
        debug!(%reference, "get_entity: called");
        match self.get(reference).await? {
            Some(doc) => Ok(Some(Entity::from_document(&doc)?)),
            None => Ok(None),
        }
    }

    /// Get an entity, returning error if not found
    pub async fn get_entity_required(&self, reference: &DocRef) -> StateResponse<Entity> {
        debug!(%reference, "get_entity_required: called");
        self.get_entity(reference)
            .await?
            .ok_or_else(|| StateError::NotFound(reference.to_string()))
    }

    /// Find an entity by id in either collection
    pub async fn find_entity(&self, id: &str) -> StateResponse<Option<Entity>> {
        debug!(%id, "find_entity: called");
        for kind in [EntityKind::Product, EntityKind::Material] {
            let reference = DocRef::new(kind.collection(), id);
            if let Some(entity) = self.get_entity(&reference).await? {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// Direct children of `parent`
    pub async fn children_of(&self, parent: &Entity) -> StateResponse<Vec<Entity>> {
        debug!(parent = %parent.reference(), "children_of: called");
        let field = match parent.kind {
            EntityKind::Product => fields::LINKED_PRODUCT,
            EntityKind::Material => fields::PARENT_MATERIAL,
        };
        let query = Query::new(EntityKind::Material.collection())
            .filter(Filter::eq(field, parent.reference().to_string()))
            .order_by("name", Order::Asc);
        self.query(query)
            .await?
            .iter()
            .map(|doc| Entity::from_document(doc).map_err(StateError::from))
            .collect()
    }

    pub async fn list_entities(&self, kind: EntityKind) -> StateResponse<Vec<Entity>> {
        debug!(%kind, "list_entities: called");
        self.query(Query::new(kind.collection()))
            .await?
            .iter()
            .map(|doc| Entity::from_document(doc).map_err(StateError::from))
            .collect()
    }

    // === Artifact operations ===

    /// Artifacts recorded for an entity, oldest first
    pub async fn artifacts_for(&self, entity: &DocRef) -> StateResponse<Vec<Artifact>> {
        debug!(%entity, "artifacts_for: called");
        let query = Query::new(Artifact::COLLECTION)
            .filter(Filter::eq("entity", entity.to_string()))
            .order_by("created_at", Order::Asc);
        self.query(query)
            .await?
            .iter()
            .map(|doc| doc.decode::<Artifact>().map_err(StateError::from))
            .collect()
    }

    // === Shutdown ===

    /// Shutdown the actor
    pub async fn shutdown(&self) -> StateResponse<()> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

/// The actor loop that processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("actor_loop: called");
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::Get { reference, reply } => {
                debug!(%reference, "actor_loop: Get command");
                let _ = reply.send(store.get(&reference).map_err(StateError::from));
            }

            StateCommand::Query { query, reply } => {
                debug!(collection = %query.collection, "actor_loop: Query command");
                let _ = reply.send(store.query(&query).map_err(StateError::from));
            }

            StateCommand::Commit { batch, reply } => {
                debug!(writes = batch.len(), "actor_loop: Commit command");
                let _ = reply.send(store.commit(batch).map_err(StateError::from));
            }

            StateCommand::Collections { reply } => {
                debug!("actor_loop: Collections command");
                let _ = reply.send(store.collections().map_err(StateError::from));
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
