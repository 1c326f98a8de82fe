use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use seine::prelude::{BatchOp, Entity, Store, StoreError, StoreKey, StoreValue};

/// A mock `Store`: one in-memory map per collection, upsert-by-id only, with
/// an op journal. Enough store for the ingestion tests, which only touch the
/// `__meta__` cursor and migration entity snapshots.
#[derive(Default)]
pub struct MockStore {
    collections: Mutex<HashMap<String, HashMap<String, Entity>>>,
    journal: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn new() -> Self {
        MockStore::default()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    /// Direct read access for assertions.
    pub fn entity(&self, collection: &str, id: &str) -> Option<Entity> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .and_then(|entities| entities.get(id))
            .cloned()
    }

    /// Seed an entity without touching the journal.
    pub fn seed(&self, collection: &str, entity: Entity) {
        let id = entity.id().unwrap_or_default().to_owned();
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_owned())
            .or_default()
            .insert(id, entity);
    }

    fn record(&self, line: String) {
        self.journal.lock().unwrap().push(line);
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get(&self, key: &StoreKey) -> Result<StoreValue, StoreError> {
        self.record(format!("get {}", key));
        let collections = self.collections.lock().unwrap();
        match &key.id {
            Some(id) => collections
                .get(&key.collection)
                .and_then(|entities| entities.get(id))
                .cloned()
                .map(StoreValue::One)
                .ok_or_else(|| StoreError::NotFound(key.to_string())),
            None => Ok(StoreValue::Many(
                collections
                    .get(&key.collection)
                    .map(|entities| entities.values().cloned().collect())
                    .unwrap_or_default(),
            )),
        }
    }

    async fn put(&self, key: &StoreKey, value: Entity) -> Result<(), StoreError> {
        self.record(format!("put {}", key));
        let id = key
            .id
            .clone()
            .ok_or_else(|| StoreError::BadKey(key.to_string()))?;
        self.collections
            .lock()
            .unwrap()
            .entry(key.collection.clone())
            .or_default()
            .insert(id, value);
        Ok(())
    }

    async fn del(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.record(format!("del {}", key));
        let id = key
            .id
            .as_deref()
            .ok_or_else(|| StoreError::BadKey(key.to_string()))?;
        if let Some(entities) = self.collections.lock().unwrap().get_mut(&key.collection) {
            entities.remove(id);
        }
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.record(format!("batch len={}", ops.len()));
        for op in ops {
            match op {
                BatchOp::Put { key, value } => self.put(&key, value).await?,
                BatchOp::Del { key } => self.del(&key).await?,
            }
        }
        Ok(())
    }
}
