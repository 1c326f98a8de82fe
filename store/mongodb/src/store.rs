use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use slog::{debug, trace, Logger};

use seine::prelude::{
    BatchOp, EngineFlags, Entity, Store, StoreError, StoreKey, StoreValue, META_COLLECTION,
};

use crate::documents::{BulkOp, DocumentDatabase, VIEW_PAGE_SIZE};

/// The store adapter: mutable/immutable collection semantics and batched
/// writes over a document database, fronted by an in-memory hot cache.
///
/// The cache mirrors the latest successful write of every `(collection, id)`
/// pair seen in this process and serves reads before the database. In
/// `read_only` mode the cache still updates but nothing durable is written.
pub struct DocumentStore<D> {
    db: D,
    cache: RwLock<HashMap<String, HashMap<String, Entity>>>,
    immutable_refs: HashSet<String>,
    flags: EngineFlags,
    logger: Logger,
}

impl<D: DocumentDatabase> DocumentStore<D> {
    pub fn new(
        logger: Logger,
        db: D,
        immutable_refs: impl IntoIterator<Item = String>,
        flags: EngineFlags,
    ) -> Self {
        DocumentStore {
            db,
            cache: RwLock::new(HashMap::new()),
            immutable_refs: immutable_refs.into_iter().collect(),
            flags,
            logger,
        }
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// `__meta__` is always mutable, whatever the configuration says.
    fn is_immutable(&self, collection: &str) -> bool {
        collection != META_COLLECTION && self.immutable_refs.contains(collection)
    }

    /// Whether a read for this collection may go to the database. A fresh
    /// database has nothing to read; a warm one serves everything except
    /// `__meta__` from the cache.
    fn reads_through(&self, collection: &str) -> bool {
        if self.flags.new_db {
            return false;
        }
        !self.flags.warm_db || collection == META_COLLECTION
    }

    fn cached_entity(&self, collection: &str, id: &str) -> Option<Entity> {
        self.cache
            .read()
            .unwrap()
            .get(collection)
            .and_then(|entities| entities.get(id))
            .cloned()
    }

    fn cached_collection(&self, collection: &str) -> Option<Vec<Entity>> {
        self.cache
            .read()
            .unwrap()
            .get(collection)
            .map(|entities| entities.values().cloned().collect())
    }

    fn cache_put(&self, collection: &str, id: &str, value: Entity) {
        self.cache
            .write()
            .unwrap()
            .entry(collection.to_owned())
            .or_default()
            .insert(id.to_owned(), value);
    }

    fn cache_del(&self, collection: &str, id: &str) {
        let mut cache = self.cache.write().unwrap();
        if let Some(entities) = cache.get_mut(collection) {
            entities.remove(id);
        }
    }

    /// The id a put addresses, cross-checked against the value. A value
    /// without an `id` attribute adopts the key's.
    fn put_id(key: &StoreKey, value: &mut Entity) -> Result<String, StoreError> {
        let id = key
            .id
            .clone()
            .ok_or_else(|| StoreError::BadKey(key.to_string()))?;
        match value.id() {
            Some(value_id) if value_id != id => Err(StoreError::IdMismatch {
                key: key.to_string(),
                value: value_id.to_owned(),
            }),
            Some(_) => Ok(id),
            None => {
                value.insert("id", serde_json::Value::String(id.clone()));
                Ok(id)
            }
        }
    }

    /// The full latest-per-id view of an immutable collection, paged in
    /// fixed-size batches to bound driver memory.
    async fn materialised_view(&self, collection: &str) -> Result<Vec<Entity>, StoreError> {
        let mut view = Vec::new();
        let mut skip = 0u64;
        loop {
            let page = self.db.latest_versions_page(collection, skip).await?;
            let last_page = (page.len() as i64) < VIEW_PAGE_SIZE;
            view.extend(page);
            if last_page {
                return Ok(view);
            }
            skip += VIEW_PAGE_SIZE as u64;
        }
    }

    async fn get_entity(&self, key: &StoreKey, id: &str) -> Result<StoreValue, StoreError> {
        if let Some(hit) = self.cached_entity(&key.collection, id) {
            trace!(self.logger, "Cache hit"; "key" => %key);
            return Ok(StoreValue::One(hit));
        }

        if self.reads_through(&key.collection) {
            if let Some(found) = self.db.find_newest(&key.collection, id).await? {
                return Ok(StoreValue::One(found));
            }
        }

        Err(StoreError::NotFound(key.to_string()))
    }

    async fn get_collection(&self, key: &StoreKey) -> Result<StoreValue, StoreError> {
        if self.reads_through(&key.collection) {
            if self.is_immutable(&key.collection) {
                return Ok(StoreValue::Many(
                    self.materialised_view(&key.collection).await?,
                ));
            }
            return Ok(StoreValue::Many(self.db.find_all(&key.collection).await?));
        }

        if let Some(entities) = self.cached_collection(&key.collection) {
            return Ok(StoreValue::Many(entities));
        }

        Err(StoreError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl<D: DocumentDatabase> Store for DocumentStore<D> {
    async fn get(&self, key: &StoreKey) -> Result<StoreValue, StoreError> {
        match &key.id {
            Some(id) => self.get_entity(key, id).await,
            None => self.get_collection(key).await,
        }
    }

    async fn put(&self, key: &StoreKey, mut value: Entity) -> Result<(), StoreError> {
        let id = Self::put_id(key, &mut value)?;
        value.strip_object_id();

        self.cache_put(&key.collection, &id, value.clone());

        if self.flags.read_only {
            return Ok(());
        }

        if self.is_immutable(&key.collection) {
            self.db.replace_version(&key.collection, &value).await
        } else {
            self.db.replace_mutable(&key.collection, &id, &value).await
        }
    }

    async fn del(&self, key: &StoreKey) -> Result<(), StoreError> {
        let id = key
            .id
            .as_deref()
            .ok_or_else(|| StoreError::BadKey(key.to_string()))?;

        self.cache_del(&key.collection, id);

        if self.flags.read_only {
            return Ok(());
        }

        self.db.delete_newest(&key.collection, id).await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        // Assemble per-collection bulk operations. The cache updates here,
        // synchronously, so reads issued while the bulk writes are in
        // flight already see the new values.
        let mut grouped: Vec<(String, Vec<BulkOp>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let mut push = |collection: &str, op: BulkOp| {
            let slot = *index.entry(collection.to_owned()).or_insert_with(|| {
                grouped.push((collection.to_owned(), Vec::new()));
                grouped.len() - 1
            });
            grouped[slot].1.push(op);
        };

        for op in ops {
            match op {
                BatchOp::Put { key, mut value } => {
                    let id = Self::put_id(&key, &mut value)?;
                    value.strip_object_id();
                    self.cache_put(&key.collection, &id, value.clone());
                    let versioned = self.is_immutable(&key.collection);
                    push(&key.collection, BulkOp::Replace { doc: value, versioned });
                }
                BatchOp::Del { key } => {
                    let id = key
                        .id
                        .clone()
                        .ok_or_else(|| StoreError::BadKey(key.to_string()))?;
                    self.cache_del(&key.collection, &id);
                    push(&key.collection, BulkOp::Delete { id });
                }
            }
        }

        if self.flags.read_only {
            return Ok(());
        }

        // Collections commit independently; a failed one is reported so the
        // caller can retry its ops as a unit, after the rest were attempted.
        let mut failed: Option<StoreError> = None;
        for (collection, bulk_ops) in grouped {
            if let Err(e) = self.db.bulk(&collection, &bulk_ops).await {
                debug!(self.logger, "Bulk write failed"; "collection" => collection.as_str());
                if failed.is_none() {
                    failed = Some(StoreError::Bulk {
                        collection,
                        source: e.into(),
                    });
                }
            }
        }

        match failed {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use seine::log::discard;
    use seine::prelude::Store;

    use crate::memory::MemoryDocuments;

    const IMMUTABLE_REF: &str = "transfers";
    const MUTABLE_REF: &str = "exampleRef";

    fn store_with_flags(flags: EngineFlags) -> DocumentStore<MemoryDocuments> {
        DocumentStore::new(
            discard(),
            MemoryDocuments::new(),
            vec![IMMUTABLE_REF.to_owned()],
            flags,
        )
    }

    fn store() -> DocumentStore<MemoryDocuments> {
        store_with_flags(EngineFlags::default())
    }

    fn entity(value: serde_json::Value) -> Entity {
        Entity::try_from(value).unwrap()
    }

    fn version(id: &str, ts: i64, data: &str) -> Entity {
        entity(json!({
            "id": id,
            "_block_ts": ts,
            "_block_num": ts,
            "_chain_id": 1,
            "data": data,
        }))
    }

    #[tokio::test]
    async fn mutable_puts_are_idempotent() {
        let store = store();
        let key = StoreKey::parse("exampleRef.id1").unwrap();
        let value = entity(json!({"id": "id1", "data": "v1"}));

        store.put(&key, value.clone()).await.unwrap();
        store.put(&key, value.clone()).await.unwrap();

        assert_eq!(store.database().document_count(MUTABLE_REF), 1);
        assert_eq!(
            store.get(&key).await.unwrap(),
            StoreValue::One(value.clone())
        );
    }

    #[tokio::test]
    async fn immutable_puts_version_and_reads_return_the_newest() {
        let store = store();

        store
            .put(
                &StoreKey::entity(IMMUTABLE_REF, "id1"),
                version("id1", 10, "old"),
            )
            .await
            .unwrap();
        store
            .put(
                &StoreKey::entity(IMMUTABLE_REF, "id1"),
                version("id1", 20, "new"),
            )
            .await
            .unwrap();

        // Both versions persist.
        assert_eq!(store.database().document_count(IMMUTABLE_REF), 2);

        // The cache holds the last write; bypassing it must still serve the
        // higher `_block_ts`.
        let fresh = store_reusing(store);
        let got = fresh
            .get(&StoreKey::entity(IMMUTABLE_REF, "id1"))
            .await
            .unwrap();
        assert_eq!(got, StoreValue::One(version("id1", 20, "new")));
    }

    /// Rebuild the adapter around the same database, losing the hot cache.
    fn store_reusing(store: DocumentStore<MemoryDocuments>) -> DocumentStore<MemoryDocuments> {
        DocumentStore::new(
            discard(),
            store.db,
            vec![IMMUTABLE_REF.to_owned()],
            EngineFlags::default(),
        )
    }

    #[tokio::test]
    async fn identical_version_keys_overwrite_in_place() {
        let store = store();
        let key = StoreKey::entity(IMMUTABLE_REF, "id1");

        store.put(&key, version("id1", 10, "a")).await.unwrap();
        store.put(&key, version("id1", 10, "b")).await.unwrap();

        assert_eq!(store.database().document_count(IMMUTABLE_REF), 1);
    }

    #[tokio::test]
    async fn materialised_view_returns_one_record_per_id() {
        let store = store();
        let key = StoreKey::collection(IMMUTABLE_REF);

        for id in ["a", "b", "c"] {
            for ts in [10, 20, 30] {
                store
                    .put(&StoreKey::entity(IMMUTABLE_REF, id), version(id, ts, "x"))
                    .await
                    .unwrap();
            }
        }

        let view = store.get(&key).await.unwrap().entities();
        assert_eq!(view.len(), 3);
        for record in view {
            assert_eq!(record.block_ts(), 30);
        }
    }

    #[tokio::test]
    async fn mutable_collection_scan_returns_everything() {
        let store = store();
        store
            .put(
                &StoreKey::entity(MUTABLE_REF, "id1"),
                entity(json!({"id": "id1"})),
            )
            .await
            .unwrap();
        store
            .put(
                &StoreKey::entity(MUTABLE_REF, "id2"),
                entity(json!({"id": "id2"})),
            )
            .await
            .unwrap();

        let all = store
            .get(&StoreKey::collection(MUTABLE_REF))
            .await
            .unwrap()
            .entities();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn get_by_id_queries_newest_when_cache_is_cold() {
        let store = store();
        store
            .database()
            .replace_version(MUTABLE_REF, &version("id1", 30, "newest"))
            .await
            .unwrap();
        store
            .database()
            .replace_version(MUTABLE_REF, &version("id1", 10, "oldest"))
            .await
            .unwrap();

        let got = store
            .get(&StoreKey::parse("exampleRef.id1").unwrap())
            .await
            .unwrap();
        assert_eq!(got, StoreValue::One(version("id1", 30, "newest")));

        // The read went through as a newest-first query.
        assert!(store
            .database()
            .journal()
            .contains(&"find_newest exampleRef id=id1".to_owned()));
    }

    #[tokio::test]
    async fn missing_entities_are_not_found() {
        let store = store();
        let err = store
            .get(&StoreKey::entity(MUTABLE_REF, "ghost"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn batch_matches_sequential_application() {
        let sequential = store();
        let batched = store();

        let a = entity(json!({"id": "id1", "data": "v1"}));
        let b = entity(json!({"id": "id2", "data": "v2"}));

        sequential
            .put(&StoreKey::entity(MUTABLE_REF, "id1"), a.clone())
            .await
            .unwrap();
        sequential
            .put(&StoreKey::entity(MUTABLE_REF, "id2"), b.clone())
            .await
            .unwrap();
        sequential
            .del(&StoreKey::entity(MUTABLE_REF, "id3"))
            .await
            .unwrap();

        batched
            .batch(vec![
                BatchOp::Put {
                    key: StoreKey::parse("exampleRef.id1").unwrap(),
                    value: a,
                },
                BatchOp::Put {
                    key: StoreKey::parse("exampleRef.id2").unwrap(),
                    value: b,
                },
                BatchOp::Del {
                    key: StoreKey::parse("exampleRef.id3").unwrap(),
                },
            ])
            .await
            .unwrap();

        let mut left = sequential
            .get(&StoreKey::collection(MUTABLE_REF))
            .await
            .unwrap()
            .entities();
        let mut right = batched
            .get(&StoreKey::collection(MUTABLE_REF))
            .await
            .unwrap()
            .entities();
        left.sort_by(|x, y| x.id().cmp(&y.id()));
        right.sort_by(|x, y| x.id().cmp(&y.id()));
        assert_eq!(left, right);
    }

    #[tokio::test]
    async fn batch_issues_one_unordered_bulk_per_collection() {
        let store = store();

        store
            .batch(vec![
                BatchOp::Put {
                    key: StoreKey::parse("exampleRef.id1").unwrap(),
                    value: entity(json!({"id": "id1", "data": "v1"})),
                },
                BatchOp::Put {
                    key: StoreKey::parse("exampleRef.id2").unwrap(),
                    value: entity(json!({"id": "id2", "data": "v2"})),
                },
                BatchOp::Del {
                    key: StoreKey::parse("exampleRef.id3").unwrap(),
                },
            ])
            .await
            .unwrap();

        let journal = store.database().journal();
        assert_eq!(
            journal,
            vec!["bulk exampleRef unordered [replace:id1 replace:id2 delete_many:id3]".to_owned()]
        );
    }

    #[tokio::test]
    async fn batch_strips_reserved_object_ids() {
        let store = store();

        store
            .batch(vec![BatchOp::Put {
                key: StoreKey::entity(MUTABLE_REF, "id1"),
                value: entity(json!({"_id": "engine-reserved", "id": "id1"})),
            }])
            .await
            .unwrap();

        let stored = store
            .get(&StoreKey::entity(MUTABLE_REF, "id1"))
            .await
            .unwrap()
            .into_one()
            .unwrap();
        assert!(!stored.contains_key("_id"));
    }

    #[tokio::test]
    async fn batch_cache_updates_are_visible_immediately() {
        let store = store();
        store
            .batch(vec![BatchOp::Put {
                key: StoreKey::entity(MUTABLE_REF, "id1"),
                value: entity(json!({"id": "id1", "data": "v1"})),
            }])
            .await
            .unwrap();

        // Served by the cache, not the database.
        let journal_before = store.database().journal().len();
        let got = store
            .get(&StoreKey::entity(MUTABLE_REF, "id1"))
            .await
            .unwrap();
        assert_eq!(
            got,
            StoreValue::One(entity(json!({"id": "id1", "data": "v1"})))
        );
        assert_eq!(store.database().journal().len(), journal_before);
    }

    #[tokio::test]
    async fn read_only_writes_reach_the_cache_but_not_the_database() {
        let store = store_with_flags(EngineFlags {
            read_only: true,
            ..EngineFlags::default()
        });
        let key = StoreKey::entity(MUTABLE_REF, "id1");
        let value = entity(json!({"id": "id1", "data": "v1"}));

        store.put(&key, value.clone()).await.unwrap();
        store
            .batch(vec![BatchOp::Put {
                key: StoreKey::entity(MUTABLE_REF, "id2"),
                value: entity(json!({"id": "id2"})),
            }])
            .await
            .unwrap();
        store.del(&StoreKey::entity(MUTABLE_REF, "id2")).await.unwrap();

        assert_eq!(store.database().journal().len(), 0);
        assert_eq!(store.database().document_count(MUTABLE_REF), 0);
        assert_eq!(store.get(&key).await.unwrap(), StoreValue::One(value));
    }

    #[tokio::test]
    async fn new_db_never_reads_through() {
        let store = store_with_flags(EngineFlags {
            new_db: true,
            ..EngineFlags::default()
        });
        store
            .database()
            .replace_mutable(MUTABLE_REF, "id1", &entity(json!({"id": "id1"})))
            .await
            .unwrap();
        let journal_before = store.database().journal().len();

        let err = store
            .get(&StoreKey::entity(MUTABLE_REF, "id1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.database().journal().len(), journal_before);
    }

    #[tokio::test]
    async fn warm_db_serves_from_cache_except_meta() {
        let store = store_with_flags(EngineFlags {
            warm_db: true,
            ..EngineFlags::default()
        });

        // Seed the database behind the cache's back.
        store
            .database()
            .replace_mutable(MUTABLE_REF, "id1", &entity(json!({"id": "id1"})))
            .await
            .unwrap();
        store
            .database()
            .replace_mutable(META_COLLECTION, "chain_1", &entity(json!({"id": "chain_1"})))
            .await
            .unwrap();

        // Non-meta reads do not reach the database.
        assert!(store
            .get(&StoreKey::entity(MUTABLE_REF, "id1"))
            .await
            .unwrap_err()
            .is_not_found());

        // `__meta__` always reads through.
        let meta = store
            .get(&StoreKey::entity(META_COLLECTION, "chain_1"))
            .await
            .unwrap();
        assert_eq!(meta, StoreValue::One(entity(json!({"id": "chain_1"}))));
    }

    #[tokio::test]
    async fn meta_is_mutable_even_when_listed_immutable() {
        let store = DocumentStore::new(
            discard(),
            MemoryDocuments::new(),
            vec![META_COLLECTION.to_owned()],
            EngineFlags::default(),
        );

        let cursor = entity(json!({"id": "chain_1", "number": 1, "locked": false}));
        store
            .put(&StoreKey::entity(META_COLLECTION, "chain_1"), cursor)
            .await
            .unwrap();
        store
            .put(
                &StoreKey::entity(META_COLLECTION, "chain_1"),
                entity(json!({"id": "chain_1", "number": 2, "locked": false})),
            )
            .await
            .unwrap();

        assert_eq!(store.database().document_count(META_COLLECTION), 1);
    }

    #[tokio::test]
    async fn del_removes_only_the_newest_version() {
        let store = store();
        let key = StoreKey::entity(IMMUTABLE_REF, "id1");

        store.put(&key, version("id1", 10, "old")).await.unwrap();
        store.put(&key, version("id1", 20, "new")).await.unwrap();
        store.del(&key).await.unwrap();

        assert_eq!(store.database().document_count(IMMUTABLE_REF), 1);
        let fresh = store_reusing(store);
        let got = fresh.get(&key).await.unwrap();
        assert_eq!(got, StoreValue::One(version("id1", 10, "old")));
    }

    #[tokio::test]
    async fn update_is_multi_put_sugar() {
        let store = store();

        let mut entries = HashMap::new();
        entries.insert(
            "exampleRef.id1".to_owned(),
            entity(json!({"id": "id1", "data": "v1"})),
        );
        entries.insert(
            "exampleRef.id2".to_owned(),
            entity(json!({"id": "id2", "data": "v2"})),
        );
        store.update(entries).await.unwrap();

        assert_eq!(store.database().document_count(MUTABLE_REF), 2);
        let journal = store.database().journal();
        assert_eq!(journal.len(), 1);
        assert!(journal[0].starts_with("bulk exampleRef unordered"));
    }

    #[tokio::test]
    async fn id_mismatch_is_rejected() {
        let store = store();
        let err = store
            .put(
                &StoreKey::entity(MUTABLE_REF, "id1"),
                entity(json!({"id": "other"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IdMismatch { .. }));
    }

    #[tokio::test]
    async fn values_without_an_id_adopt_the_keys() {
        let store = store();
        store
            .put(
                &StoreKey::entity(MUTABLE_REF, "id1"),
                entity(json!({"data": "v1"})),
            )
            .await
            .unwrap();

        let got = store
            .get(&StoreKey::entity(MUTABLE_REF, "id1"))
            .await
            .unwrap()
            .into_one()
            .unwrap();
        assert_eq!(got.id(), Some("id1"));
    }
}
